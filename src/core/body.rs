//! Request body admission: upload limits, optional buffering and form parsing.
use std::io::Read;

use axum::body::Body as AxumBody;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{Method, StatusCode, header};
use multer::{Constraints, Multipart, SizeLimit};
use thiserror::Error;

use crate::core::context::{RequestContext, UploadedFile};

/// Body admission failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BodyError {
    #[error("request body exceeds the limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("failed to read request body: {0}")]
    Read(String),

    #[error("invalid multipart body: {0}")]
    Multipart(String),

    #[error("failed to decode gzip request body: {0}")]
    Decode(#[from] std::io::Error),
}

impl BodyError {
    /// Response status for this failure: 413 for size overflows, 500 otherwise
    pub fn status(&self) -> StatusCode {
        match self {
            BodyError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Size limits applied while admitting a body
#[derive(Debug, Clone, Copy)]
pub struct BodyLimits {
    pub copy_request_body: bool,
    pub max_memory: u64,
    pub max_upload_size: u64,
}

fn is_urlencoded(content_type: &str) -> bool {
    content_type
        .to_ascii_lowercase()
        .starts_with("application/x-www-form-urlencoded")
}

async fn read_limited(body: AxumBody, limit: u64) -> Result<Bytes, BodyError> {
    let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, limit_usize).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(BodyError::TooLarge { limit })
        }
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

fn gunzip(data: &[u8], limit: u64) -> Result<Bytes, BodyError> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut decoded)?;
    if decoded.len() as u64 > limit {
        return Err(BodyError::TooLarge { limit });
    }
    Ok(Bytes::from(decoded))
}

fn parse_form(ctx: &mut RequestContext, body: &[u8]) {
    ctx.input.form.extend(
        url::form_urlencoded::parse(body).map(|(k, v)| (k.into_owned(), v.into_owned())),
    );
}

async fn read_multipart(
    ctx: &mut RequestContext,
    body: AxumBody,
    limit: u64,
) -> Result<(), BodyError> {
    let boundary = multer::parse_boundary(ctx.input.content_type())
        .map_err(|e| BodyError::Multipart(e.to_string()))?;
    let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(limit));
    let mut multipart = Multipart::with_constraints(body.into_data_stream(), boundary, constraints);

    let multer_error = |e: multer::Error| match e {
        multer::Error::StreamSizeExceeded { limit } => BodyError::TooLarge { limit },
        other => BodyError::Multipart(other.to_string()),
    };

    while let Some(field) = multipart.next_field().await.map_err(multer_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|m| m.to_string());
        let data = field.bytes().await.map_err(multer_error)?;
        match file_name {
            Some(file_name) => ctx.input.files.push(UploadedFile {
                field: name,
                file_name: Some(file_name),
                content_type,
                data,
            }),
            None => ctx
                .input
                .form
                .push((name, String::from_utf8_lossy(&data).into_owned())),
        }
    }
    Ok(())
}

/// Read and parse the request body into the context.
///
/// GET and HEAD bodies are ignored. Uploads are bounded by `max_upload_size`; other bodies
/// are buffered only when `copy_request_body` is set, after rejecting a declared
/// `Content-Length` above `max_memory`. URL-encoded forms are always parsed.
pub async fn admit_body(
    ctx: &mut RequestContext,
    body: AxumBody,
    limits: BodyLimits,
) -> Result<(), BodyError> {
    let method = ctx.input.method();
    if method == Method::GET || method == Method::HEAD {
        return Ok(());
    }

    if ctx.input.is_upload() {
        return read_multipart(ctx, body, limits.max_upload_size).await;
    }

    let urlencoded = is_urlencoded(ctx.input.content_type());
    if limits.copy_request_body {
        if ctx
            .input
            .content_length()
            .is_some_and(|len| len > limits.max_memory)
        {
            return Err(BodyError::TooLarge {
                limit: limits.max_memory,
            });
        }
        let mut data = read_limited(body, limits.max_memory).await?;
        let gzipped = ctx
            .input
            .header(header::CONTENT_ENCODING)
            .is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"));
        if gzipped {
            data = gunzip(&data, limits.max_memory)?;
        }
        if urlencoded {
            parse_form(ctx, &data);
        }
        ctx.input.body = data;
    } else if urlencoded {
        let data = read_limited(body, limits.max_memory).await?;
        parse_form(ctx, &data);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use flate2::{Compression, write::GzEncoder};
    use hyper::Request;

    use super::*;
    use crate::core::context::ContextServices;

    fn limits(copy: bool, max_memory: u64, max_upload: u64) -> BodyLimits {
        BodyLimits {
            copy_request_body: copy,
            max_memory,
            max_upload_size: max_upload,
        }
    }

    fn context(method: Method, headers: &[(&str, &str)]) -> RequestContext {
        let mut builder = Request::builder().method(method).uri("/submit");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let mut ctx = RequestContext::new(Arc::new(ContextServices::default()));
        ctx.reset(builder.body(()).unwrap().into_parts().0, None);
        ctx
    }

    #[tokio::test]
    async fn test_declared_length_over_limit() {
        let mut ctx = context(Method::POST, &[("content-length", "2048")]);
        let err = admit_body(&mut ctx, AxumBody::from("x"), limits(true, 1024, 1 << 20))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit() {
        let mut ctx = context(Method::POST, &[]);
        let err = admit_body(&mut ctx, AxumBody::from(vec![b'a'; 64]), limits(true, 16, 1 << 20))
            .await
            .unwrap_err();
        assert!(matches!(err, BodyError::TooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_buffered_form_body() {
        let mut ctx = context(
            Method::POST,
            &[("content-type", "application/x-www-form-urlencoded")],
        );
        admit_body(&mut ctx, AxumBody::from("name=alice&tag=a"), limits(true, 1024, 1024))
            .await
            .unwrap();
        assert_eq!(ctx.input.query("name"), Some("alice"));
        assert_eq!(ctx.input.body(), &Bytes::from_static(b"name=alice&tag=a"));
    }

    #[tokio::test]
    async fn test_form_parsed_without_buffering() {
        let mut ctx = context(
            Method::PUT,
            &[("content-type", "application/x-www-form-urlencoded")],
        );
        admit_body(&mut ctx, AxumBody::from("a=1"), limits(false, 1024, 1024))
            .await
            .unwrap();
        assert_eq!(ctx.input.query("a"), Some("1"));
        assert!(ctx.input.body().is_empty());
    }

    #[tokio::test]
    async fn test_gzip_body_is_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut ctx = context(Method::POST, &[("content-encoding", "gzip")]);
        admit_body(&mut ctx, AxumBody::from(compressed), limits(true, 1024, 1024))
            .await
            .unwrap();
        assert_eq!(ctx.input.body(), &Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let body = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            hello\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file body\r\n\
            --XYZ--\r\n";
        let mut ctx = context(
            Method::POST,
            &[("content-type", "multipart/form-data; boundary=XYZ")],
        );
        admit_body(&mut ctx, AxumBody::from(body), limits(false, 1024, 1024))
            .await
            .unwrap();

        assert_eq!(ctx.input.query("title"), Some("hello"));
        let file = ctx.input.file("doc").unwrap();
        assert_eq!(file.file_name.as_deref(), Some("a.txt"));
        assert_eq!(file.data, Bytes::from_static(b"file body"));
    }

    #[tokio::test]
    async fn test_multipart_over_upload_limit() {
        let payload = "x".repeat(256);
        let body = format!(
            "--XYZ\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\r\n{payload}\r\n--XYZ--\r\n"
        );
        let mut ctx = context(
            Method::POST,
            &[("content-type", "multipart/form-data; boundary=XYZ")],
        );
        let err = admit_body(&mut ctx, AxumBody::from(body), limits(false, 1024, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_get_body_ignored() {
        let mut ctx = context(Method::GET, &[("content-length", "99999")]);
        admit_body(&mut ctx, AxumBody::from("ignored"), limits(true, 1, 1))
            .await
            .unwrap();
        assert!(ctx.input.body().is_empty());
    }
}
