use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use anyhow::bail;
use axum::extract::Multipart;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tokio::fs::{create_dir_all, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use uuid::Uuid;

use crate::Error;

pub const MATERIALS_DIR: &str = "materials";
pub const RESUMES_DIR: &str = "resumes";

/// Largest multipart body [`Form::read`] will buffer, over all parts.
pub const MAX_FORM_BYTES: usize = 25 * 1024 * 1024;

pub async fn prepare_io(media_root: &Path) -> anyhow::Result<()> {
    for dir in [MATERIALS_DIR, RESUMES_DIR] {
        create_dir_all(media_root.join(dir)).await?;
    }
    Ok(())
}

/// Keeps the last path segment of an uploaded name and drops anything odd.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Writes `bytes` below `media_root/dir` and returns the stored relative path.
pub async fn store_upload(
    media_root: &Path,
    dir: &str,
    original_name: &str,
    bytes: &[u8],
) -> anyhow::Result<String> {
    let relative = format!("{}/{}-{}", dir, Uuid::new_v4(), sanitize_file_name(original_name));
    let file = create_io_file(media_root.join(&relative)).await?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(relative)
}

pub async fn create_io_file(path: PathBuf) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await?;
    }
    if path.exists() {
        bail!("File already exists!")
    }
    File::create(path).await.map_err(anyhow::Error::from)
}

/// Reads a stored upload; paths escaping `media_root` are refused.
pub async fn read_io_file(media_root: &Path, relative: &str) -> Result<Vec<u8>, Error> {
    let rel = Path::new(relative);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::not_found("File does not exist"));
    }
    let mut bytes = Vec::new();
    BufReader::new(File::open(media_root.join(rel)).await?)
        .read_to_end(&mut bytes)
        .await?;
    Ok(bytes)
}

pub async fn remove_io_file(media_root: &Path, relative: &str) {
    if let Err(err) = tokio::fs::remove_file(media_root.join(relative)).await {
        log::warn!("could not remove stored file {}: {}", relative, err);
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// A fully buffered multipart body: text fields and file parts by name.
#[derive(Debug, Default)]
pub struct Form {
    pub fields: HashMap<String, String>,
    pub files: HashMap<String, Upload>,
}

impl Form {
    pub async fn read(mut multipart: Multipart) -> Result<Form, Error> {
        let mut form = Form::default();
        let mut total = 0;
        while let Some(mut field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let mut bytes = Vec::new();
            while let Some(chunk) = field.chunk().await? {
                total = capped(total, chunk.len(), &name)?;
                bytes.extend_from_slice(&chunk);
            }
            match file_name {
                Some(file_name) => {
                    form.files.insert(name, Upload { file_name, bytes });
                }
                None => {
                    let text = String::from_utf8(bytes)
                        .map_err(|_| Error::field(&name, "Expected UTF-8 text."))?;
                    form.fields.insert(name, text);
                }
            }
        }
        Ok(form)
    }

    /// Trimmed value of a text field; blank counts as absent.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &str) -> Result<&str, Error> {
        self.text(key)
            .ok_or_else(|| Error::field(key, "This field is required."))
    }

    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, Error>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.text(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|err| Error::field(key, format!("Invalid value `{}`: {}", raw, err)))
            })
            .transpose()
    }

    pub fn file(&self, key: &str) -> Result<&Upload, Error> {
        self.files
            .get(key)
            .filter(|upload| !upload.bytes.is_empty())
            .ok_or_else(|| Error::field(key, "No file was submitted."))
    }
}

/// Adds `len` to the running body size, refusing bodies over [`MAX_FORM_BYTES`].
fn capped(total: usize, len: usize, field: &str) -> Result<usize, Error> {
    let total = total + len;
    if total > MAX_FORM_BYTES {
        return Err(Error::field(
            field,
            format!(
                "Upload is too large, the limit is {} MB.",
                MAX_FORM_BYTES / (1024 * 1024)
            ),
        ));
    }
    Ok(total)
}

pub fn content_type(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Streams a stored file back with a type guessed from its extension.
pub async fn file_response(media_root: &Path, relative: &str) -> Result<Response, Error> {
    let bytes = read_io_file(media_root, relative).await?;
    Ok(([(header::CONTENT_TYPE, content_type(relative))], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_are_flattened() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\CV final.pdf"), "CV_final.pdf");
        assert_eq!(sanitize_file_name(".."), "upload");
    }

    #[test]
    fn form_fields_are_trimmed_and_validated() {
        let mut form = Form::default();
        form.fields.insert("name".into(), "  Batch 7 ".into());
        form.fields.insert("blank".into(), "   ".into());
        form.fields.insert("minutes".into(), "45".into());
        form.fields.insert("date".into(), "soon".into());

        assert_eq!(form.text("name"), Some("Batch 7"));
        assert_eq!(form.text("blank"), None);
        assert!(matches!(form.required("blank"), Err(Error::Validation { .. })));
        assert_eq!(form.parse::<i32>("minutes").unwrap(), Some(45));
        assert_eq!(form.parse::<i32>("missing").unwrap(), None);
        assert!(form.parse::<chrono::NaiveDate>("date").is_err());
        assert!(form.file("file").is_err());
    }

    #[test]
    fn oversized_bodies_are_refused() {
        assert_eq!(capped(0, 1024, "file").unwrap(), 1024);
        assert_eq!(capped(MAX_FORM_BYTES - 1, 1, "file").unwrap(), MAX_FORM_BYTES);
        match capped(MAX_FORM_BYTES, 1, "resume") {
            Err(Error::Validation { fields }) => assert!(fields.contains_key("resume")),
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn multipart_bodies_are_buffered_by_field() {
        use axum::body::Body;
        use axum::extract::{FromRequest, RequestParts};
        use axum::http::Request;

        let body = "--XyZ\r\n\
            Content-Disposition: form-data; name=\"name\"\r\n\r\n\
            Batch 7\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"roster.csv\"\r\n\
            Content-Type: text/csv\r\n\r\n\
            name,email\r\n\
            --XyZ--\r\n";
        let request = Request::builder()
            .method("POST")
            .header("Content-Type", "multipart/form-data; boundary=XyZ")
            .body(Body::from(body))
            .unwrap();
        let multipart = Multipart::from_request(&mut RequestParts::new(request))
            .await
            .unwrap();

        let form = Form::read(multipart).await.unwrap();
        assert_eq!(form.text("name"), Some("Batch 7"));
        let upload = form.file("file").unwrap();
        assert_eq!(upload.file_name, "roster.csv");
        assert_eq!(upload.bytes, b"name,email");
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type("materials/x-intro.PDF"), "application/pdf");
        assert_eq!(content_type("materials/x-clip.mp4"), "video/mp4");
        assert_eq!(content_type("materials/noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn stored_uploads_read_back() {
        let root = std::env::temp_dir().join(format!("parc-io-{}", Uuid::new_v4()));
        prepare_io(&root).await.unwrap();
        let path = store_upload(&root, RESUMES_DIR, "cv.pdf", b"%PDF-1.4").await.unwrap();
        assert!(path.starts_with("resumes/"));
        assert!(path.ends_with("-cv.pdf"));
        assert_eq!(read_io_file(&root, &path).await.unwrap(), b"%PDF-1.4");

        assert!(matches!(
            read_io_file(&root, "../secret").await,
            Err(Error::NotFound { .. })
        ));
        remove_io_file(&root, &path).await;
        assert!(matches!(
            read_io_file(&root, &path).await,
            Err(Error::NotFound { .. })
        ));
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
