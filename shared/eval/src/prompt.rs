use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Separates description, exemplars and target in plain-text prompts.
pub const FEWSHOT_DELIMITER: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A rendered prompt: either plain text or a structured conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Chat(Vec<ChatMessage>),
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Prompt::Text(text.into())
    }

    /// Length in characters, summed over turns for conversations.
    pub fn len(&self) -> usize {
        match self {
            Prompt::Text(text) => text.chars().count(),
            Prompt::Chat(messages) => messages.iter().map(|m| m.content.chars().count()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Display for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prompt::Text(text) => write!(f, "{text}"),
            Prompt::Chat(messages) => {
                let json = serde_json::to_string(messages).map_err(|_| std::fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

/// How a conversation is handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationTemplate {
    /// Structured role/content turns, sent as-is to chat endpoints.
    Chatgpt,
    /// Turns rendered into a single ChatML string ending with an open assistant turn.
    ChatMl,
}

impl ConversationTemplate {
    pub const ALL: [ConversationTemplate; 2] =
        [ConversationTemplate::Chatgpt, ConversationTemplate::ChatMl];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ConversationTemplate::Chatgpt => "chatgpt",
            ConversationTemplate::ChatMl => "chatml",
        }
    }

    fn render(&self, messages: Vec<ChatMessage>) -> Prompt {
        match self {
            ConversationTemplate::Chatgpt => Prompt::Chat(messages),
            ConversationTemplate::ChatMl => {
                let mut text = String::new();
                for message in &messages {
                    text.push_str("<|im_start|>");
                    text.push_str(message.role.as_str());
                    text.push('\n');
                    text.push_str(&message.content);
                    text.push_str("<|im_end|>\n");
                }
                text.push_str("<|im_start|>assistant\n");
                Prompt::Text(text)
            }
        }
    }
}

impl Display for ConversationTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConversationTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "chatgpt" | "openai" => Ok(ConversationTemplate::Chatgpt),
            "chatml" => Ok(ConversationTemplate::ChatMl),
            other => bail!(
                "Unknown conversation template {other}, expected one of: {}",
                ConversationTemplate::ALL.map(|t| t.as_str()).join(", ")
            ),
        }
    }
}

/// Rendering switches that come from the run configuration rather than from the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptStyle {
    pub conversation_template: Option<ConversationTemplate>,
    pub as_single_user_message: bool,
    /// Per-task: put the description in a system turn instead of the first user turn.
    pub description_as_system: bool,
}

/// One rendered exemplar: `doc_to_text` and `doc_to_target` of a pool document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedExemplar {
    pub text: String,
    pub target: String,
}

fn plain_text(description: &str, exemplars: &[RenderedExemplar], target_text: &str) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(exemplars.len() + 2);
    if !description.is_empty() {
        parts.push(description.to_owned());
    }
    parts.extend(exemplars.iter().map(|e| format!("{}{}", e.text, e.target)));
    parts.push(target_text.to_owned());
    parts.join(FEWSHOT_DELIMITER)
}

/// Builds the prompt context for one target document.
///
/// Without a conversation template, the description, each exemplar (`text + target`) and the
/// target's text are joined by [`FEWSHOT_DELIMITER`]. With a template, exemplars become
/// alternating user/assistant turns, unless `as_single_user_message` flattens everything into
/// one user turn holding the plain-text rendering.
pub fn assemble(
    description: &str,
    exemplars: &[RenderedExemplar],
    target_text: &str,
    style: PromptStyle,
) -> Prompt {
    let Some(template) = style.conversation_template else {
        return Prompt::Text(plain_text(description, exemplars, target_text));
    };

    if style.as_single_user_message {
        let content = plain_text(description, exemplars, target_text);
        return template.render(vec![ChatMessage::new(Role::User, content)]);
    }

    let mut messages = Vec::with_capacity(exemplars.len() * 2 + 2);
    let mut pending_description = None;
    if !description.is_empty() {
        if style.description_as_system {
            messages.push(ChatMessage::new(Role::System, description));
        } else {
            pending_description = Some(description);
        }
    }

    let mut user_turn = |content: &str| match pending_description.take() {
        Some(description) => {
            ChatMessage::new(Role::User, format!("{description}{FEWSHOT_DELIMITER}{content}"))
        }
        None => ChatMessage::new(Role::User, content),
    };

    for exemplar in exemplars {
        messages.push(user_turn(&exemplar.text));
        messages.push(ChatMessage::new(
            Role::Assistant,
            exemplar.target.trim_start(),
        ));
    }
    messages.push(user_turn(target_text));

    template.render(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn exemplars() -> Vec<RenderedExemplar> {
        vec![
            RenderedExemplar {
                text: "Pergunta: a?\nResposta:".into(),
                target: " sim".into(),
            },
            RenderedExemplar {
                text: "Pergunta: b?\nResposta:".into(),
                target: " não".into(),
            },
        ]
    }

    #[test]
    fn plain_text_joins_with_blank_lines() {
        let prompt = assemble(
            "Responda.",
            &exemplars(),
            "Pergunta: c?\nResposta:",
            PromptStyle::default(),
        );
        assert_eq!(
            prompt,
            Prompt::text(
                "Responda.\n\nPergunta: a?\nResposta: sim\n\nPergunta: b?\nResposta: não\n\nPergunta: c?\nResposta:"
            )
        );
    }

    #[test]
    fn zero_shot_without_description_is_just_the_target() {
        let prompt = assemble("", &[], "Pergunta: c?", PromptStyle::default());
        assert_eq!(prompt, Prompt::text("Pergunta: c?"));
    }

    #[test]
    fn chat_turns_with_system_description() {
        let style = PromptStyle {
            conversation_template: Some(ConversationTemplate::Chatgpt),
            as_single_user_message: false,
            description_as_system: true,
        };
        let prompt = assemble("Responda.", &exemplars()[..1], "Pergunta: c?", style);
        assert_eq!(
            prompt,
            Prompt::Chat(vec![
                ChatMessage::new(Role::System, "Responda."),
                ChatMessage::new(Role::User, "Pergunta: a?\nResposta:"),
                ChatMessage::new(Role::Assistant, "sim"),
                ChatMessage::new(Role::User, "Pergunta: c?"),
            ])
        );
    }

    #[test]
    fn description_prepended_to_first_user_turn() {
        let style = PromptStyle {
            conversation_template: Some(ConversationTemplate::Chatgpt),
            as_single_user_message: false,
            description_as_system: false,
        };
        let Prompt::Chat(messages) = assemble("Responda.", &[], "Pergunta: c?", style) else {
            panic!("expected a conversation");
        };
        assert_eq!(
            messages,
            vec![ChatMessage::new(Role::User, "Responda.\n\nPergunta: c?")]
        );
    }

    #[test]
    fn single_user_message_flattens() {
        let style = PromptStyle {
            conversation_template: Some(ConversationTemplate::Chatgpt),
            as_single_user_message: true,
            description_as_system: true,
        };
        let prompt = assemble("", &exemplars()[..1], "Pergunta: c?", style);
        assert_eq!(
            prompt,
            Prompt::Chat(vec![ChatMessage::new(
                Role::User,
                "Pergunta: a?\nResposta: sim\n\nPergunta: c?"
            )])
        );
    }

    #[test]
    fn chatml_renders_text() {
        let style = PromptStyle {
            conversation_template: Some(ConversationTemplate::ChatMl),
            ..Default::default()
        };
        let prompt = assemble("", &[], "Oi", style);
        assert_eq!(
            prompt,
            Prompt::text("<|im_start|>user\nOi<|im_end|>\n<|im_start|>assistant\n")
        );
    }

    #[test]
    fn template_names() {
        assert_eq!(
            "ChatML".parse::<ConversationTemplate>().unwrap(),
            ConversationTemplate::ChatMl
        );
        assert!("vicuna".parse::<ConversationTemplate>().is_err());
    }
}
