use std::borrow::Cow;

use lambda_http::{Body, Error, Response};
use url::Url;

pub fn valid_target(u: &str) -> bool {
    if let Ok(parsed) = Url::parse(u) {
        match parsed.scheme() {
            "http" | "https" => {}
            _ => return false,
        }
        return parsed.host().is_some();
    }
    false
}

/// Outbound URL for a candidate: absolute http(s) refs pass through,
/// anything else is treated as a code under `base`.
pub fn destination_for(base: &Url, external_ref: &str) -> String {
    if valid_target(external_ref) {
        return external_ref.to_string();
    }
    let code = urlencoding::encode(external_ref.trim_start_matches('/'));
    format!("{}{}", base.as_str(), code)
}

pub fn resp_json(status: u16, v: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(Body::Text(v.to_string()))
        .unwrap_or_else(|_| Response::new(Body::Empty))
}

pub fn json_err(
    status: u16,
    code: &'static str,
    message: impl Into<Cow<'static, str>>,
) -> Result<Response<Body>, Error> {
    let payload = serde_json::json!({
        "error": code,
        "message": message.into(),
    });
    let body = serde_json::to_string(&payload).map_err(|e| Error::from(e.to_string()))?;
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("Cache-Control", "no-store")
        .body(Body::Text(body))
        .map_err(|e| Error::from(format!("resp: {e}")))
}
