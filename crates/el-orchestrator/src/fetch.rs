//! Install script resolution

use el_core::config::ScriptSource;
use el_core::error::ConfigError;

/// Resolve the install script's bytes from a local path or by fetching the
/// configured URL, normalizing CRLF line endings to LF.
pub(crate) async fn resolve_script_bytes(source: &ScriptSource) -> Result<Vec<u8>, ConfigError> {
    let raw = match source {
        ScriptSource::Path(path) => tokio::fs::read(path)
            .await
            .map_err(|_| ConfigError::ScriptNotFound(path.clone()))?,
        _ => {
            let url = source
                .resolved_url()
                .expect("non-path script sources resolve to a URL");
            tracing::debug!("Fetching install script from {}", url);
            let response = reqwest::get(&url)
                .await
                .map_err(|e| ConfigError::Fetch(format!("{}: {}", url, e)))?;
            if !response.status().is_success() {
                return Err(ConfigError::Fetch(format!(
                    "{}: HTTP {}",
                    url,
                    response.status()
                )));
            }
            response
                .bytes()
                .await
                .map_err(|e| ConfigError::Fetch(format!("{}: {}", url, e)))?
                .to_vec()
        }
    };
    Ok(normalize_newlines(raw))
}

/// Rewrite CRLF to LF so scripts edited on Windows still run under bash.
pub(crate) fn normalize_newlines(data: Vec<u8>) -> Vec<u8> {
    if !data.contains(&b'\r') {
        return data;
    }
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(byte);
    }
    out
}
