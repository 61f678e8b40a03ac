use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor,
};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::{blip, blip_text},
};
use hf_hub::api::tokio::ApiBuilder;
use image::{imageops::FilterType, DynamicImage};
use tokenizers::Tokenizer;
use tracing::{debug, instrument, Instrument};

use super::Captioner;
use crate::config::BlipModel;

const IMAGE_SIZE: u32 = 384;
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

// [DEC] starts every caption, [SEP] ends it.
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

const WEIGHTS_FILE: &str = "model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = blip::VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: IMAGE_SIZE as usize,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

fn model_config(model: BlipModel) -> blip::Config {
    match model {
        BlipModel::Base => blip_base_config(),
        BlipModel::Large => blip::Config::image_captioning_large(),
    }
}

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        debug!("CUDA and Metal are not available, using CPU");
        Ok(Device::Cpu)
    }
}

/// Local BLIP captioning model running on candle.
pub struct Blip {
    inner: Arc<Inner>,
}

struct Inner {
    // The text decoder keeps a KV cache, so generation needs exclusive access.
    state: Mutex<State>,
    tokenizer: Tokenizer,
    device: Device,
    max_tokens: usize,
}

struct State {
    model: blip::BlipForConditionalGeneration,
    logits_processor: LogitsProcessor,
}

impl Blip {
    pub async fn load(
        model: BlipModel,
        cpu: bool,
        max_tokens: usize,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut builder = ApiBuilder::new();
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder.build().context("failed to build Hugging Face Hub client")?;
        let repo = api.model(model.repo().to_string());

        let (weights, tokenizer) = async {
            let weights = repo
                .get(WEIGHTS_FILE)
                .await
                .with_context(|| format!("failed to fetch {WEIGHTS_FILE} from {}", model.repo()))?;
            let tokenizer = repo
                .get(TOKENIZER_FILE)
                .await
                .with_context(|| format!("failed to fetch {TOKENIZER_FILE} from {}", model.repo()))?;
            anyhow::Ok((weights, tokenizer))
        }
        .instrument(tracing::info_span!("hf_download", repo = model.repo()))
        .await?;

        let tokenizer = Tokenizer::from_file(&tokenizer)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", tokenizer.display()))?;
        let device = device(cpu)?;
        let config = model_config(model);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let model = blip::BlipForConditionalGeneration::new(&config, vb)?;

        // No temperature means argmax, which keeps captions deterministic.
        let logits_processor = LogitsProcessor::new(1337, None, None);

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    model,
                    logits_processor,
                }),
                tokenizer,
                device,
                max_tokens,
            }),
        })
    }
}

#[async_trait]
impl Captioner for Blip {
    fn name(&self) -> &str {
        "blip"
    }

    async fn caption(&self, path: &Path) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || inner.caption(&path)).await?
    }
}

impl Inner {
    #[instrument(level = "debug", skip(self))]
    fn caption(&self, path: &Path) -> Result<String> {
        let image = load_image(path)?;
        let pixel_values = preprocess(&image)?.to_device(&self.device)?;

        let token_ids = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("BLIP model lock poisoned"))?;
            state.generate(&pixel_values, &self.device, self.max_tokens)?
        };
        debug!(tokens = token_ids.len(), "generated caption tokens");

        let text = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| anyhow!("failed to decode caption: {e}"))?;
        finish_caption(&text)
    }
}

impl State {
    fn generate(
        &mut self,
        pixel_values: &Tensor,
        device: &Device,
        max_tokens: usize,
    ) -> Result<Vec<u32>> {
        let image_embeds = pixel_values
            .unsqueeze(0)?
            .apply(self.model.vision_model())?;

        self.model.text_decoder().reset_kv_cache();

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..new_token_budget(max_tokens) {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], device)?.unsqueeze(0)?;
            let logits = self
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        Ok(token_ids)
    }
}

/// `max_tokens` bounds the whole sequence, BOS included.
fn new_token_budget(max_tokens: usize) -> usize {
    max_tokens.saturating_sub(1)
}

fn finish_caption(text: &str) -> Result<String> {
    let caption = text.trim();
    if caption.is_empty() {
        bail!("model produced an empty caption");
    }
    Ok(caption.to_string())
}

/// Opens an image by sniffing its content; the file extension is not trusted.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let image = image::io::Reader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("not a readable image: {}", path.display()))?;
    Ok(image)
}

/// RGB, 384x384 bicubic, scaled to [0, 1] and normalized. Returns a (3, 384, 384) tensor on CPU.
pub fn preprocess(image: &DynamicImage) -> candle_core::Result<Tensor> {
    let size = IMAGE_SIZE as usize;
    let data = image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let data = Tensor::from_vec(data, (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}
