use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Phi3,
    Unknown,
}

impl PromptFamily {
    pub fn infer_from_filename(name: &str) -> Self {
        let lowered = name.to_lowercase();
        if lowered.contains("llama") {
            PromptFamily::Llama
        } else if lowered.contains("qwen") {
            PromptFamily::Qwen
        } else if lowered.contains("mistral") || lowered.contains("mixtral") {
            PromptFamily::Mistral
        } else if lowered.contains("phi-3") || lowered.contains("phi3") {
            PromptFamily::Phi3
        } else {
            PromptFamily::Unknown
        }
    }

    pub fn stop_markers(self) -> &'static [&'static str] {
        match self {
            PromptFamily::Llama => &["<|eot_id|>", "<|end_of_text|>"],
            PromptFamily::Qwen => &["<|im_end|>", "<|endoftext|>"],
            PromptFamily::Mistral => &["</s>"],
            PromptFamily::Phi3 => &["<|end|>", "<|endoftext|>"],
            PromptFamily::Unknown => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Raw text, no markers.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLine {
    pub role: Role,
    pub message: String,
}

impl ContextLine {
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(Role::System, message)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(Role::User, message)
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        Self::new(Role::Assistant, message)
    }
}

/// Role start/end markers of a chat-tuned model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    pub system_start: String,
    pub system_end: String,
    pub user_start: String,
    pub user_end: String,
    pub assistant_start: String,
    pub assistant_end: String,
}

impl ChatTemplate {
    pub fn for_family(family: PromptFamily) -> Self {
        let (system, user, assistant, end): (&str, &str, &str, &str) = match family {
            PromptFamily::Llama => (
                "<|start_header_id|>system<|end_header_id|>\n\n",
                "<|start_header_id|>user<|end_header_id|>\n\n",
                "<|start_header_id|>assistant<|end_header_id|>\n\n",
                "<|eot_id|>",
            ),
            PromptFamily::Qwen => (
                "<|im_start|>system\n",
                "<|im_start|>user\n",
                "<|im_start|>assistant\n",
                "<|im_end|>\n",
            ),
            PromptFamily::Phi3 => ("<|system|>\n", "<|user|>\n", "<|assistant|>\n", "<|end|>\n"),
            PromptFamily::Mistral => {
                return Self {
                    system_start: "[INST] ".to_string(),
                    system_end: "\n".to_string(),
                    user_start: "[INST] ".to_string(),
                    user_end: " [/INST]".to_string(),
                    assistant_start: String::new(),
                    assistant_end: "</s>".to_string(),
                };
            }
            PromptFamily::Unknown => {
                return Self {
                    system_start: "\n[system]\n".to_string(),
                    system_end: "\n[/system]\n".to_string(),
                    user_start: "\n[user]\n".to_string(),
                    user_end: "\n[/user]\n".to_string(),
                    assistant_start: "\n[assistant]\n".to_string(),
                    assistant_end: "\n[/assistant]\n".to_string(),
                };
            }
        };

        Self {
            system_start: system.to_string(),
            system_end: end.to_string(),
            user_start: user.to_string(),
            user_end: end.to_string(),
            assistant_start: assistant.to_string(),
            assistant_end: end.to_string(),
        }
    }

    pub fn markers(&self, role: Role) -> (&str, &str) {
        match role {
            Role::System => (&self.system_start, &self.system_end),
            Role::User => (&self.user_start, &self.user_end),
            Role::Assistant => (&self.assistant_start, &self.assistant_end),
            Role::None => ("", ""),
        }
    }

    /// Wraps every line with its role markers. When the conversation ends on
    /// a user line and `append_assistant_start` is set, the assistant start
    /// marker is appended so generation continues as the assistant.
    pub fn render(&self, lines: &[ContextLine], append_assistant_start: bool) -> String {
        let mut rendered = String::new();
        for line in lines {
            let (start, end) = self.markers(line.role);
            rendered.push_str(start);
            rendered.push_str(&line.message);
            rendered.push_str(end);
        }

        let ends_on_user = lines.last().map(|l| l.role == Role::User).unwrap_or(false);
        if ends_on_user && append_assistant_start && !rendered.is_empty() {
            rendered.push_str(&self.assistant_start);
        }

        rendered
    }
}

pub fn should_stop_on_text(family: PromptFamily, text: &str) -> bool {
    family
        .stop_markers()
        .iter()
        .any(|marker| text.contains(marker))
}
