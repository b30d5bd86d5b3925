//! Request Builder: turns a [`GenerationSpec`] into a transport-ready request.

use bytes::Bytes;
use reqwest::Method;

use crate::config::{GeneratorConfig, ResponseFormat};
use crate::error::BuildError;
use crate::spec::GenerationSpec;

/// Form fields the builder owns; `params` may not shadow them.
const RESERVED_FIELDS: [&str; 8] = [
    "prompt",
    "negative_prompt",
    "output_format",
    "seed",
    "image",
    "strength",
    "width",
    "height",
];

const LINE_ENDING: &str = "\r\n";

/// Fully formed outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    endpoint: String,
    api_key: Option<String>,
    response_format: ResponseFormat,
    max_dimension: u32,
}

impl RequestBuilder {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            response_format: config.response_format,
            max_dimension: config.max_request_dimension,
        }
    }

    /// Validate `spec` and serialize it. Performs no I/O.
    pub fn build(&self, spec: &GenerationSpec) -> Result<OutboundRequest, BuildError> {
        self.validate(spec)?;

        let boundary = format!("----texgen-{}", &spec.hash()[..24]);
        let mut form = MultipartForm::new(&boundary);

        form.text("prompt", spec.prompt.trim());
        form.text("output_format", "png");
        if let Some(negative) = spec.negative_prompt.as_deref().filter(|n| !n.trim().is_empty()) {
            form.text("negative_prompt", negative.trim());
        }
        if let Some(seed) = spec.seed.filter(|s| *s > 0) {
            form.text("seed", &seed.to_string());
        }
        if let Some(dims) = spec.dimensions {
            form.text("width", &dims.width.to_string());
            form.text("height", &dims.height.to_string());
        }
        if let Some(reference) = spec.reference.as_ref().filter(|r| !r.png.is_empty()) {
            form.file("image", "reference.png", "image/png", &reference.png);
            // strength is required whenever a reference image is sent
            form.text("strength", &format!("{:.1}", reference.strength.clamp(0.0, 1.0)));
        }
        for (key, value) in &spec.params {
            form.text(key, value);
        }

        let mut headers = Vec::with_capacity(3);
        if let Some(key) = &self.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        headers.push((
            "Accept".to_string(),
            self.response_format.accept_header().to_string(),
        ));
        headers.push((
            "Content-Type".to_string(),
            format!("multipart/form-data; boundary={boundary}"),
        ));

        Ok(OutboundRequest {
            method: Method::POST,
            url: format!("{}{}", self.endpoint, spec.model.endpoint_path()),
            headers,
            body: form.finish(),
        })
    }

    fn validate(&self, spec: &GenerationSpec) -> Result<(), BuildError> {
        if spec.prompt.trim().is_empty() {
            return Err(invalid("prompt is empty"));
        }
        validate_destination(&spec.destination)?;

        let (_, name) = spec.target();
        if name.trim().is_empty() {
            return Err(invalid("asset name is empty"));
        }
        if name.contains(['/', '\\']) {
            return Err(invalid(format!("asset name '{name}' contains a path separator")));
        }

        if let Some(dims) = spec.dimensions {
            for (axis, value) in [("width", dims.width), ("height", dims.height)] {
                if value == 0 || value > self.max_dimension {
                    return Err(invalid(format!(
                        "{axis} {value} outside 1..={}",
                        self.max_dimension
                    )));
                }
            }
        }

        if let Some(reference) = &spec.reference {
            if !reference.strength.is_finite() {
                return Err(invalid("reference strength is not a finite number"));
            }
        }

        if let Some(key) = spec.params.keys().find(|k| k.trim().is_empty()) {
            return Err(invalid(format!("parameter key '{key}' is empty")));
        }
        // keys land verbatim in a Content-Disposition header
        if let Some(key) = spec.params.keys().find(|k| !is_field_token(k)) {
            return Err(invalid(format!("parameter key {key:?} is not a plain field name")));
        }
        if let Some(key) = spec.params.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str())) {
            return Err(invalid(format!("parameter '{key}' is reserved")));
        }

        Ok(())
    }
}

/// Relative, `/`-separated, no empty, `.` or `..` segments. A trailing `/` is allowed.
fn validate_destination(destination: &str) -> Result<(), BuildError> {
    let trimmed = destination.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("destination path is empty"));
    }
    if destination.starts_with('/') || destination.contains('\\') || destination.contains(':') {
        return Err(invalid(format!("destination '{destination}' is not a relative path")));
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid(format!(
                "destination '{destination}' has an invalid segment '{segment}'"
            )));
        }
        if segment.chars().any(char::is_control) {
            return Err(invalid(format!("destination '{destination}' contains control characters")));
        }
    }
    Ok(())
}

/// ASCII letters, digits, `_`, `-` and `.`.
fn is_field_token(key: &str) -> bool {
    key.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn invalid(reason: impl Into<String>) -> BuildError {
    BuildError::InvalidSpec(reason.into())
}

struct MultipartForm<'a> {
    boundary: &'a str,
    data: Vec<u8>,
}

impl<'a> MultipartForm<'a> {
    fn new(boundary: &'a str) -> Self {
        Self {
            boundary,
            data: Vec::new(),
        }
    }

    fn text(&mut self, name: &str, value: &str) {
        self.open(&format!("Content-Disposition: form-data; name=\"{name}\""));
        self.data.extend_from_slice(LINE_ENDING.as_bytes());
        self.data.extend_from_slice(value.as_bytes());
        self.data.extend_from_slice(LINE_ENDING.as_bytes());
    }

    fn file(&mut self, name: &str, filename: &str, content_type: &str, bytes: &[u8]) {
        self.open(&format!(
            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\""
        ));
        self.data
            .extend_from_slice(format!("Content-Type: {content_type}{LINE_ENDING}{LINE_ENDING}").as_bytes());
        self.data.extend_from_slice(bytes);
        self.data.extend_from_slice(LINE_ENDING.as_bytes());
    }

    fn open(&mut self, disposition: &str) {
        self.data
            .extend_from_slice(format!("--{}{LINE_ENDING}{disposition}{LINE_ENDING}", self.boundary).as_bytes());
    }

    fn finish(mut self) -> Bytes {
        self.data
            .extend_from_slice(format!("--{}--{LINE_ENDING}", self.boundary).as_bytes());
        Bytes::from(self.data)
    }
}
