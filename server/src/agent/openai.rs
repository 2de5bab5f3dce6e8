//! `OpenAI`-compatible provider built on the `async-openai` crate.
//!
//! Works against any endpoint speaking the `OpenAI` chat-completion
//! protocol via the base-URL override. Streaming tool-call argument
//! fragments are buffered per index and emitted as complete calls when
//! the stream finishes.

use crate::agent::message::{AgentMessage, CompletionRequest, Role, ToolCallRequest};
use crate::agent::provider::{CompletionEvent, CompletionProvider, EventStream};
use crate::config::Config;
use crate::error::{Error, Result};
use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestToolMessage, ChatCompletionRequestUserMessage, ChatCompletionTool,
    ChatCompletionToolType, CreateChatCompletionRequest, FunctionCall, FunctionObject,
    ReasoningEffort,
};
use async_trait::async_trait;
use futures_util::StreamExt;

/// Streaming provider for `OpenAI`-compatible chat completion APIs.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    reasoning: bool,
}

impl OpenAiProvider {
    /// Build a provider from server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no LLM endpoint or key material is
    /// configured at all.
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.llm_url.is_none() && config.llm_api_key.is_none() {
            return Err(Error::Config(
                "LLM provider requires DEVATLAS_LLM_URL or DEVATLAS_LLM_API_KEY".into(),
            ));
        }
        let mut openai_config = OpenAIConfig::new();
        if let Some(key) = &config.llm_api_key {
            openai_config = openai_config.with_api_key(key);
        }
        if let Some(url) = &config.llm_url {
            openai_config = openai_config.with_api_base(url.trim_end_matches('/'));
        }
        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.llm_model.clone(),
            max_tokens: config.llm_max_tokens,
            temperature: config.llm_temperature,
            reasoning: config.llm_reasoning,
        })
    }

    /// Converts our message type to the `OpenAI` SDK type.
    fn convert_message(msg: &AgentMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                        msg.content.clone(),
                    ),
                    name: None,
                })
            }
            Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: async_openai::types::ChatCompletionRequestUserMessageContent::Text(
                    msg.content.clone(),
                ),
                name: None,
            }),
            Role::Assistant => {
                let tool_calls = if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        msg.tool_calls
                            .iter()
                            .map(|tc| ChatCompletionMessageToolCall {
                                id: tc.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                };
                let content = if msg.content.is_empty() {
                    None
                } else {
                    Some(
                        async_openai::types::ChatCompletionRequestAssistantMessageContent::Text(
                            msg.content.clone(),
                        ),
                    )
                };
                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content,
                    name: None,
                    tool_calls,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
            Role::Tool => ChatCompletionRequestMessage::Tool(ChatCompletionRequestToolMessage {
                content: async_openai::types::ChatCompletionRequestToolMessageContent::Text(
                    msg.content.clone(),
                ),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            }),
        }
    }

    fn build_request(&self, request: &CompletionRequest) -> CreateChatCompletionRequest {
        let messages: Vec<_> = request.messages.iter().map(Self::convert_message).collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|td| ChatCompletionTool {
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionObject {
                            name: td.name.clone(),
                            description: Some(td.description.clone()),
                            parameters: Some(td.input_schema.clone()),
                            strict: None,
                        },
                    })
                    .collect(),
            )
        };

        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.temperature).filter(|&t| t != 0.0),
            max_completion_tokens: Some(self.max_tokens),
            stream: Some(true),
            tools,
            reasoning_effort: self.reasoning.then_some(ReasoningEffort::Medium),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Tool-call fragments accumulated across stream deltas, keyed by index.
#[derive(Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<EventStream> {
        let openai_request = self.build_request(request);

        let mut stream = self
            .client
            .chat()
            .create_stream(openai_request)
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        let mapped = async_stream::try_stream! {
            let mut partial: Vec<PartialCall> = Vec::new();

            while let Some(item) = stream.next().await {
                let chunk = item.map_err(|e| Error::Provider(e.to_string()))?;
                let Some(choice) = chunk.choices.first() else { continue };

                if let Some(text) = &choice.delta.content {
                    if !text.is_empty() {
                        yield CompletionEvent::Token(text.clone());
                    }
                }

                if let Some(fragments) = &choice.delta.tool_calls {
                    for fragment in fragments {
                        let index = fragment.index as usize;
                        if partial.len() <= index {
                            partial.resize(index + 1, PartialCall::default());
                        }
                        let slot = &mut partial[index];
                        if let Some(id) = &fragment.id {
                            slot.id.clone_from(id);
                        }
                        if let Some(function) = &fragment.function {
                            if let Some(name) = &function.name {
                                slot.name.push_str(name);
                            }
                            if let Some(arguments) = &function.arguments {
                                slot.arguments.push_str(arguments);
                            }
                        }
                    }
                }
            }

            for call in partial.into_iter().filter(|c| !c.name.is_empty()) {
                yield CompletionEvent::ToolCall(ToolCallRequest {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                });
            }
            yield CompletionEvent::Done;
        };

        Ok(Box::pin(mapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message;
    use crate::tools::ToolDescriptor;

    fn provider() -> OpenAiProvider {
        OpenAiProvider {
            client: Client::with_config(OpenAIConfig::new()),
            model: "gpt-4o".into(),
            max_tokens: 512,
            temperature: 0.2,
            reasoning: false,
        }
    }

    #[test]
    fn converts_all_roles() {
        let p = [
            message::system("s"),
            message::user("u"),
            message::assistant("a", Vec::new()),
            message::tool_result("call_1", "out"),
        ];
        assert!(matches!(
            OpenAiProvider::convert_message(&p[0]),
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(
            OpenAiProvider::convert_message(&p[1]),
            ChatCompletionRequestMessage::User(_)
        ));
        assert!(matches!(
            OpenAiProvider::convert_message(&p[2]),
            ChatCompletionRequestMessage::Assistant(_)
        ));
        assert!(matches!(
            OpenAiProvider::convert_message(&p[3]),
            ChatCompletionRequestMessage::Tool(_)
        ));
    }

    #[test]
    fn assistant_tool_calls_survive_conversion() {
        let msg = message::assistant(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "search_code".into(),
                arguments: r#"{"query":"jwt"}"#.into(),
            }],
        );
        if let ChatCompletionRequestMessage::Assistant(a) = OpenAiProvider::convert_message(&msg) {
            let calls = a.tool_calls.expect("tool calls present");
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].function.name, "search_code");
        } else {
            panic!("expected assistant message");
        }
    }

    #[test]
    fn request_carries_tools_and_streaming() {
        let request = CompletionRequest {
            messages: vec![message::user("hello")],
            tools: vec![ToolDescriptor {
                name: "search_code".into(),
                description: "search".into(),
                input_schema: serde_json::json!({ "type": "object" }),
            }],
        };
        let built = provider().build_request(&request);
        assert_eq!(built.stream, Some(true));
        assert_eq!(built.tools.as_ref().map(Vec::len), Some(1));
        assert_eq!(built.max_completion_tokens, Some(512));
        assert!(built.reasoning_effort.is_none());
    }
}
