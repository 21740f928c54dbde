//! MIME utilities shared across modules

const ALLOWED_IMAGE_MIME: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Lowercases a MIME type, drops parameters and folds known aliases.
#[must_use]
pub fn canonicalize_mime(mime: &str) -> String {
    let main = mime
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match main.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        other => other.to_string(),
    }
}

/// Returns whether a given MIME type is supported for image uploads.
#[must_use]
pub fn is_supported_image_mime(mime: &str) -> bool {
    let canon = canonicalize_mime(mime);
    ALLOWED_IMAGE_MIME.contains(&canon.as_str())
}

/// Picks the content type for an upload: the declared one when present, otherwise a guess
/// from the file name. Returns `None` when neither yields anything.
#[must_use]
pub fn resolve_content_type(file_name: &str, declared: Option<&str>) -> Option<String> {
    declared
        .map(str::trim)
        .filter(|d| !d.is_empty() && *d != "application/octet-stream")
        .map(canonicalize_mime)
        .or_else(|| {
            mime_guess::from_path(file_name)
                .first()
                .map(|m| canonicalize_mime(m.essence_str()))
        })
}

/// Preferred file extension for a canonical image MIME type.
#[must_use]
pub fn extension_for(mime: &str) -> Option<&'static str> {
    match canonicalize_mime(mime).as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}
