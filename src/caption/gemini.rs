use std::{io::Cursor, path::Path};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageOutputFormat};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::Captioner;

const ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const PROMPT: &str = "Describe this image in one short sentence, like an image caption.";
const JPEG_QUALITY: u8 = 85;

/// Captions images through the Google Gemini `generateContent` API.
pub struct Gemini {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl Gemini {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Captioner for Gemini {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(level = "debug", skip(self), fields(model = %self.model))]
    async fn caption(&self, path: &Path) -> Result<String> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&data)).await??;

        let payload = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": PROMPT },
                    {
                        "inline_data": {
                            "mime_type": "image/jpeg",
                            "data": general_purpose::STANDARD.encode(&jpeg),
                        }
                    }
                ]
            }]
        });

        debug!("sending request to Gemini");
        let response = self
            .client
            .post(format!("{ENDPOINT}/{}:generateContent", self.model))
            .query(&[("key", &self.api_key)])
            .json(&payload)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let excerpt: String = body.chars().take(500).collect();
            bail!("Gemini API error {status}: {excerpt}");
        }

        parse_caption(&body)
    }
}

/// Decodes any supported format, drops alpha, and re-encodes as JPEG.
fn encode_jpeg(data: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory(data).context("not a readable image")?;
    let image = DynamicImage::ImageRgb8(image.to_rgb8());

    let mut jpeg = Vec::new();
    image.write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(JPEG_QUALITY))?;
    Ok(jpeg)
}

fn parse_caption(body: &str) -> Result<String> {
    let response: GenerateResponse =
        serde_json::from_str(body).context("unexpected Gemini response")?;

    let caption = response
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .find_map(|p| p.text)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());

    match caption {
        Some(caption) => Ok(caption),
        None => bail!("no caption in Gemini response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_candidate_text() -> Result<()> {
        let body = r#"{
            "candidates": [{
                "content": { "parts": [{ "text": "  a dog running on a beach\n" }], "role": "model" },
                "finishReason": "STOP"
            }]
        }"#;
        assert_eq!(parse_caption(body)?, "a dog running on a beach");
        Ok(())
    }

    #[test]
    fn empty_candidates_are_an_error() {
        assert!(parse_caption(r#"{"candidates": []}"#).is_err());
        assert!(parse_caption(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).is_err());
        assert!(parse_caption(r#"{"candidates": [{"content": {"parts": [{"text": "   "}]}}]}"#).is_err());
    }

    #[test]
    fn encode_jpeg_rejects_garbage() {
        assert!(encode_jpeg(b"definitely not an image").is_err());
    }

    #[test]
    fn encode_jpeg_accepts_rgba_png() -> Result<()> {
        let image = image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 128]));
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;

        let jpeg = encode_jpeg(&png)?;
        assert_eq!(image::guess_format(&jpeg)?, image::ImageFormat::Jpeg);
        Ok(())
    }
}
