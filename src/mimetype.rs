//! Mime classification for uploaded files. The mime type is inferred from
//! the file extension; the description and file-type views feed the
//! per-project histogram counters.

/// Infer a mime type from a file name's extension. Parameters such as
/// charset are stripped; unknown extensions map to "unknown".
pub fn mime_from_name(name: &str) -> String {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => return "unknown".to_string(),
    };

    let mime = match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "text/xml",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        "tex" => "application/x-latex",
        "bin" | "dat" => "application/octet-stream",
        _ => return "unknown".to_string(),
    };

    match mime.split_once(';') {
        Some((base, _)) => base.trim().to_string(),
        None => mime.trim().to_string(),
    }
}

/// Description used for the project file-type histogram.
pub fn mime_to_description(mime: &str) -> &'static str {
    match mime {
        "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "MS-Word",
        "application/vnd.ms-powerpoint"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            "PowerPoint"
        }
        "application/vnd.ms-excel"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "Excel",
        "video/webm" | "video/mp4" => "Video",
        "image/gif" | "image/jpeg" | "image/png" | "image/tiff" | "image/x-ms-bmp"
        | "image/bmp" => "Image",
        "application/octet-stream" => "Binary",
        "application/pdf" => "PDF",
        "text/plain" | "text/csv" | "application/json" => "Text",
        other => {
            if other.contains("video") {
                "Video"
            } else if other.contains("zip") {
                "Zipfile"
            } else if other.contains("latex") {
                "Latex"
            } else {
                "Unknown"
            }
        }
    }
}

/// Coarse file-type bucket, used by search facets in the metadata service.
pub fn mime_to_file_type(mime: &str) -> &'static str {
    match mime {
        "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/vnd.ms-powerpoint"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "office",
        "application/vnd.ms-excel"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "excel",
        "video/webm" | "video/mp4" => "video",
        "image/gif" | "image/jpeg" | "image/png" | "image/tiff" | "image/x-ms-bmp"
        | "image/bmp" => "image",
        "application/octet-stream" => "binary",
        "application/pdf" => "pdf",
        "text/plain" | "text/csv" | "application/json" => "text",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_name() {
        assert_eq!(mime_from_name("results.csv"), "text/csv");
        assert_eq!(mime_from_name("scan.TIFF"), "image/tiff");
        assert_eq!(mime_from_name("readme"), "unknown");
        assert_eq!(mime_from_name("archive."), "unknown");
        assert_eq!(mime_from_name("paper.pdf"), "application/pdf");
    }

    #[test]
    fn test_mime_to_description() {
        assert_eq!(mime_to_description("text/csv"), "Text");
        assert_eq!(mime_to_description("application/pdf"), "PDF");
        assert_eq!(mime_to_description("video/x-matroska"), "Video");
        assert_eq!(mime_to_description("application/x-zip-compressed"), "Zipfile");
        assert_eq!(mime_to_description("application/x-latex"), "Latex");
        assert_eq!(mime_to_description("application/weird"), "Unknown");
    }

    #[test]
    fn test_mime_to_file_type() {
        assert_eq!(mime_to_file_type("application/vnd.ms-excel"), "excel");
        assert_eq!(mime_to_file_type("image/png"), "image");
        assert_eq!(mime_to_file_type("application/weird"), "unknown");
    }
}
