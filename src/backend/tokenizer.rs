use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::errors::BackendError;
use crate::prompting::PromptFamily;

/// End-of-generation token ids of a tokenizer: the end-of-sequence token and
/// the end-of-turn token of the chat template (often the same id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct SpecialTokens {
    pub eos: u32,
    pub eot: u32,
}

impl SpecialTokens {
    pub fn contains(&self, token: u32) -> bool {
        token == self.eos || token == self.eot
    }
}

pub(super) fn resolve_tokenizer_path(model_path: &Path, hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
    }

    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let candidates = [
        parent_dir.join("tokenizer.json"),
        PathBuf::from("tokenizer.json"),
        Path::new("models").join("tokenizer.json"),
    ];

    candidates.into_iter().find(|candidate| candidate.exists())
}

fn require(tokenizer: &Tokenizer, family: PromptFamily, marker: &str) -> Result<u32, BackendError> {
    tokenizer.token_to_id(marker).ok_or_else(|| {
        BackendError::Load(format!(
            "tokenizer is incompatible with the {:?} template: missing {}",
            family, marker
        ))
    })
}

fn first_of(tokenizer: &Tokenizer, markers: &[&str]) -> Option<u32> {
    markers.iter().find_map(|marker| tokenizer.token_to_id(marker))
}

pub(super) fn resolve_special_tokens(
    tokenizer: &Tokenizer,
    family: PromptFamily,
) -> Result<SpecialTokens, BackendError> {
    let missing_eos = || {
        BackendError::Load(format!(
            "tokenizer is incompatible with the {:?} template: no end-of-sequence token",
            family
        ))
    };

    match family {
        PromptFamily::Llama => {
            let eos = first_of(tokenizer, &["<|end_of_text|>", "</s>"]).ok_or_else(missing_eos)?;
            let eot = require(tokenizer, family, "<|eot_id|>")?;
            require(tokenizer, family, "<|start_header_id|>")?;
            require(tokenizer, family, "<|end_header_id|>")?;
            Ok(SpecialTokens { eos, eot })
        }
        PromptFamily::Qwen => {
            let eos = first_of(tokenizer, &["<|endoftext|>", "</s>"]).ok_or_else(missing_eos)?;
            let eot = require(tokenizer, family, "<|im_end|>")?;
            require(tokenizer, family, "<|im_start|>")?;
            Ok(SpecialTokens { eos, eot })
        }
        PromptFamily::Phi3 => {
            let eos = first_of(tokenizer, &["<|endoftext|>", "</s>"]).ok_or_else(missing_eos)?;
            let eot = require(tokenizer, family, "<|end|>")?;
            Ok(SpecialTokens { eos, eot })
        }
        PromptFamily::Mistral => {
            let eos = first_of(tokenizer, &["</s>", "<|end_of_text|>"]).ok_or_else(missing_eos)?;
            Ok(SpecialTokens { eos, eot: eos })
        }
        PromptFamily::Unknown => {
            let eos = first_of(tokenizer, &["<|end_of_text|>", "</s>", "<|endoftext|>"]).unwrap_or(2);
            Ok(SpecialTokens { eos, eot: eos })
        }
    }
}
