use std::error::Error as StdError;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::Response as HttpResponse;
use serde_json::Value;
use tracing::warn;

use crate::error::GenerationError;

pub(crate) fn send_with_transport_retries<F>(
    provider: &str,
    max_retries: usize,
    backoff: Duration,
    send: F,
) -> Result<HttpResponse, GenerationError>
where
    F: Fn() -> reqwest::Result<HttpResponse>,
{
    let mut attempt = 0usize;
    loop {
        match send() {
            Ok(response) => return Ok(response),
            Err(err) => {
                if !is_retryable_transport_error(&err) || attempt >= max_retries {
                    return Err(GenerationError::Transport {
                        provider: provider.to_string(),
                        message: error_chain_text(&err, 512),
                    });
                }
                warn!(
                    provider,
                    retry = attempt + 1,
                    max_retries,
                    "transport retry after transient request failure"
                );
                thread::sleep(backoff * (attempt as u32 + 1));
                attempt += 1;
            }
        }
    }
}

pub(crate) fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
) -> Result<Value, GenerationError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| GenerationError::Transport {
        provider: provider.to_string(),
        message: format!("response body read failed: {}", error_chain_text(&err, 512)),
    })?;
    if !status.is_success() {
        return Err(GenerationError::Http {
            provider: provider.to_string(),
            status: code,
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| GenerationError::Transport {
        provider: provider.to_string(),
        message: format!("invalid JSON payload: {err}"),
    })
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn error_chain_text(err: &(dyn StdError + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && parts
                .last()
                .map(|existing| existing != trimmed)
                .unwrap_or(true)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Base64 payload plus mime type, ready for an image content block.
pub(crate) struct EncodedImage {
    pub mime: &'static str,
    pub data: String,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

/// Flattens alpha onto white, downsizes to `max_dim` and re-encodes as JPEG.
/// Undecodable files are sent as-is.
pub(crate) fn prepare_vision_image(
    path: &Path,
    max_dim: u32,
) -> Result<EncodedImage, GenerationError> {
    let dim = max_dim.max(128);
    if let Ok(image) = image::open(path) {
        let rgba = image.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let resized = DynamicImage::ImageRgba8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8();
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder
            .encode_image(&DynamicImage::ImageRgb8(resized))
            .is_ok()
        {
            return Ok(EncodedImage {
                mime: "image/jpeg",
                data: BASE64.encode(bytes),
            });
        }
    }

    let bytes = fs::read(path)?;
    Ok(EncodedImage {
        mime: guess_image_mime(path),
        data: BASE64.encode(bytes),
    })
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}
