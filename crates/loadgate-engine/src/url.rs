//! Target URL assembly.

use reqwest::Url;

/// Join a base URL and a path with exactly one slash between them.
///
/// Trailing slashes on the base and leading slashes on the path collapse, so
/// `http://host:8000///` + `predict` gives `http://host:8000/predict`. An
/// empty path leaves the trimmed base unchanged.
pub fn join(base: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');

    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Join and parse; the error message names the offending URL.
pub fn resolve(base: &str, path: &str) -> Result<Url, String> {
    let joined = join(base, path);
    let url = Url::parse(&joined).map_err(|e| format!("invalid URL `{}`: {}", joined, e))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported URL scheme `{}` in `{}`", other, joined)),
    }
}
