use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use strum::EnumString;

const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MAX_TOKENS: usize = 20;
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Which captioning model answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Backend {
    Blip,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BlipModel {
    Base,
    Large,
}

impl BlipModel {
    pub fn repo(&self) -> &'static str {
        match self {
            BlipModel::Base => "Salesforce/blip-image-captioning-base",
            BlipModel::Large => "Salesforce/blip-image-captioning-large",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub upload_dir: PathBuf,
    pub backend: Backend,
    pub blip_model: BlipModel,
    pub cpu: bool,
    pub max_caption_tokens: usize,
    pub max_upload_bytes: Option<usize>,
    pub model_cache_dir: Option<PathBuf>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Config {
    /// Reads the process environment. Callers load `.env` first if they want it.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let addr = parse_or(var("CAPTIONER_ADDR"), "CAPTIONER_ADDR", DEFAULT_ADDR)?;
        let upload_dir = var("CAPTIONER_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
        let backend = parse_or(var("CAPTIONER_BACKEND"), "CAPTIONER_BACKEND", "blip")?;
        let blip_model = parse_or(var("BLIP_MODEL"), "BLIP_MODEL", "base")?;
        let cpu = parse_flag(var("CAPTIONER_CPU"), "CAPTIONER_CPU")?;
        let max_caption_tokens: usize = match var("CAPTIONER_MAX_TOKENS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid CAPTIONER_MAX_TOKENS: {raw}"))?,
            None => DEFAULT_MAX_TOKENS,
        };
        // The limit counts the start token, so 2 is the smallest that yields any text.
        if max_caption_tokens < 2 {
            bail!("CAPTIONER_MAX_TOKENS must be at least 2");
        }
        let max_upload_bytes = var("CAPTIONER_MAX_UPLOAD_BYTES")
            .map(|raw| {
                raw.trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid CAPTIONER_MAX_UPLOAD_BYTES: {raw}"))
            })
            .transpose()?;
        let model_cache_dir = var("HF_HOME_DIR").map(PathBuf::from);
        let gemini_api_key = var("GEMINI_API_KEY");
        let gemini_model = var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());

        if backend == Backend::Gemini && gemini_api_key.is_none() {
            bail!("GEMINI_API_KEY must be set when CAPTIONER_BACKEND=gemini");
        }

        Ok(Self {
            addr,
            upload_dir,
            backend,
            blip_model,
            cpu,
            max_caption_tokens,
            max_upload_bytes,
            model_cache_dir,
            gemini_api_key,
            gemini_model,
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = raw.unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {key}: {raw}"))
}

fn parse_flag(raw: Option<String>, key: &str) -> Result<bool> {
    match raw.as_deref().map(str::trim) {
        None => Ok(false),
        Some("1" | "true" | "TRUE" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "no") => Ok(false),
        Some(other) => bail!("invalid {key}: {other}"),
    }
}
