mod helpers;

use std::sync::Arc;

use async_trait::async_trait;
use helpers::{call, memory_store, test_registry, ScriptedCompletion, FINAL_ANSWER};
use serde_json::json;

use arbor::agent::Agent;
use arbor::config::ContextConfig;
use arbor::context::ContextFitter;
use arbor::memory::GLOBAL_SCOPE;
use arbor::stream::StreamEvent;
use arbor::tools::{FindMemory, Tool, FIND_MEMORY};
use arbor::{Chat, Conversation, ConversationMeta, Error, FunctionSchema, Role};

const NOTES: &str = "Borrowing rules
Many readers or one writer at a time.

Release checklist
Tag the commit, then publish the crate.";

fn agent(service: Arc<ScriptedCompletion>) -> Agent {
    Agent::new(service, ContextFitter::new(ContextConfig::default()))
        .with_tool(FindMemory::default())
}

#[tokio::test]
async fn answers_after_recalling_memory() {
    let (_tmp, registry) = test_registry();
    let memory = memory_store();
    memory.ingest(NOTES, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    let conversation = Conversation::create(&registry, ConversationMeta::default())
        .unwrap()
        .with_memory(memory);

    let service = ScriptedCompletion::new(vec![
        call(FIND_MEMORY, json!({"question": "borrowing rules", "num_results": 2})),
        Chat::assistant("Many readers or one writer."),
    ]);
    let answer = agent(service.clone())
        .run(&conversation, "How does borrowing work?")
        .await
        .unwrap();
    assert_eq!(answer.chat, Chat::assistant("Many readers or one writer."));

    let messages = conversation.messages().unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.chat.role()).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::Function, Role::Assistant]
    );
    assert!(messages[0].meta.is_initial);
    assert_eq!(messages[2].action(), Some(FIND_MEMORY));
    assert_eq!(messages[3].meta.action.as_deref(), Some(FIND_MEMORY));
    assert!(messages[3].chat.content().contains("Borrowing rules"));

    // The second request carries the tool result.
    let requests = service.requests.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].last().map(Chat::role), Some(Role::Function));
}

#[tokio::test]
async fn answer_streams_to_conversation_observers() {
    let (_tmp, registry) = test_registry();
    let conversation = Conversation::create(&registry, ConversationMeta::default()).unwrap();
    let (_sub, mut events) = registry.subscribe(conversation.id());

    let service = ScriptedCompletion::new(vec![Chat::assistant("streamed answer")]);
    let answer = agent(service).run(&conversation, "Say something").await.unwrap();

    let mut streamed = String::new();
    while let Ok(event) = events.try_recv() {
        if let StreamEvent::Chunk { id, diff } = event {
            assert_eq!(id, answer.id());
            streamed.push_str(diff["content"].as_str().unwrap_or_default());
        }
    }
    assert_eq!(streamed, "streamed answer");
}

#[tokio::test]
async fn invalid_arguments_are_reported_to_the_model() {
    let (_tmp, registry) = test_registry();
    let conversation = Conversation::create(&registry, ConversationMeta::default())
        .unwrap()
        .with_memory(memory_store());

    let service = ScriptedCompletion::new(vec![
        call(FIND_MEMORY, json!({"num_results": 3})),
        call("delete_everything", json!({})),
    ]);
    let answer = agent(service).run(&conversation, "Recall something").await.unwrap();
    assert_eq!(answer.chat.content(), FINAL_ANSWER);

    let functions: Vec<String> = conversation
        .messages()
        .unwrap()
        .iter()
        .filter(|m| m.chat.role() == Role::Function)
        .map(|m| m.chat.content().to_string())
        .collect();
    assert_eq!(functions.len(), 2);
    assert!(functions[0].starts_with("Invalid arguments for find_memory"));
    assert_eq!(functions[1], "Unknown function: delete_everything");
}

#[tokio::test]
async fn step_limit_stops_a_looping_model() {
    let (_tmp, registry) = test_registry();
    let conversation = Conversation::create(&registry, ConversationMeta::default()).unwrap();
    let service = ScriptedCompletion::new(vec![
        call(FIND_MEMORY, json!({"question": "a"})),
        call(FIND_MEMORY, json!({"question": "b"})),
        call(FIND_MEMORY, json!({"question": "c"})),
    ]);

    let err = agent(service.clone())
        .with_max_steps(2)
        .run(&conversation, "loop")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StepLimit(2)));
    assert_eq!(service.request_count(), 2);
}

/// Cancels the calling conversation, as an interrupt arriving mid-run would.
struct Interrupt;

#[async_trait]
impl Tool for Interrupt {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema {
            name: "interrupt".into(),
            description: "Stop the run.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, conversation: &Conversation, _arguments: &str) -> arbor::Result<String> {
        conversation.registry().cancel(conversation.id());
        Ok("interrupted".into())
    }
}

#[tokio::test]
async fn cancellation_stops_the_run_once() {
    let (_tmp, registry) = test_registry();
    let conversation = Conversation::create(&registry, ConversationMeta::default()).unwrap();
    let service = ScriptedCompletion::new(vec![call("interrupt", json!({}))]);
    let agent = Agent::new(service.clone(), ContextFitter::new(ContextConfig::default()))
        .with_tool(Interrupt);

    let err = agent.run(&conversation, "start").await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(service.request_count(), 1);

    let answer = agent.run(&conversation, "continue").await.unwrap();
    assert_eq!(answer.chat.content(), FINAL_ANSWER);
    let systems = conversation
        .messages()
        .unwrap()
        .iter()
        .filter(|m| m.meta.is_initial)
        .count();
    assert_eq!(systems, 1);
}
