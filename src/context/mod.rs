//! Context fitting: keep a conversation's rendered history within its token budget.
//!
//! Initial messages are always kept. The rest is scanned with an increasing cut index: turns
//! before the cut are replaced by their one-line outlines in a single "earlier topics"
//! message, turns from the cut on are kept (as their chat summary). Outlines are produced on
//! demand by [`ContextFitter::to_memory`], which files the message into the conversation's
//! memory store. If even the deepest cut does not fit, the oldest half of the non-initial
//! messages is dropped and the scan repeats.

use crate::chat::{Chat, Role};
use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::tokens::count_chats;
use crate::tree::{Conversation, Message, MessageRecord};

/// Longest outline derived from a message's first line.
const OUTLINE_CHARS: usize = 120;

const EARLIER_TOPICS: &str = "Earlier topics of this conversation (details can be recalled from memory):";

pub struct ContextFitter {
    config: ContextConfig,
}

enum Scan {
    Fits(Vec<Chat>),
    /// Nothing fits; the smallest candidate seen.
    Overflows(Vec<Chat>),
}

impl ContextFitter {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    fn budget(&self, context_size: usize) -> usize {
        (context_size as f64 * self.config.fit_ratio) as usize
    }

    /// The flattened chat turns to submit for `conversation`.
    pub async fn fit(&self, conversation: &Conversation) -> Result<Vec<Chat>> {
        let context_size = conversation.context_size()?;
        let budget = self.budget(context_size);
        let messages = conversation.messages()?;
        let input: Vec<Chat> = messages.iter().map(|m| m.chat.clone()).collect();
        let input_tokens = count_chats(&input);

        let (mut init, mut rest): (Vec<MessageRecord>, Vec<MessageRecord>) =
            messages.into_iter().partition(|m| m.meta.is_initial);
        let promote_limit = (context_size as f64 * self.config.promote_ratio) as usize;
        if rest.first().is_some_and(|m| m.tokens() <= promote_limit) {
            init.push(rest.remove(0));
        }
        let init: Vec<Chat> = init.into_iter().map(|m| m.chat).collect();
        if rest.is_empty() {
            return Ok(init);
        }

        let mut smallest: Option<Vec<Chat>> = None;
        loop {
            match self.scan(conversation, &init, &mut rest, budget).await? {
                Scan::Fits(chats) => {
                    tracing::debug!(
                        conversation = %conversation.id(),
                        tokens = count_chats(&chats),
                        budget,
                        kept = rest.len(),
                        "context fitted"
                    );
                    return Ok(chats);
                }
                Scan::Overflows(candidate) => {
                    if smallest
                        .as_ref()
                        .is_none_or(|s| count_chats(&candidate) < count_chats(s))
                    {
                        smallest = Some(candidate);
                    }
                }
            }
            if rest.len() <= 1 {
                break;
            }
            let dropped = rest.len() / 2;
            rest.drain(..dropped);
            tracing::warn!(
                conversation = %conversation.id(),
                dropped,
                remaining = rest.len(),
                "history does not fit even when outlined, dropping oldest messages"
            );
        }

        let best = match smallest {
            Some(candidate) if count_chats(&candidate) <= input_tokens => candidate,
            _ => input,
        };
        tracing::warn!(
            conversation = %conversation.id(),
            tokens = count_chats(&best),
            budget,
            "context exceeds budget after maximal summarization"
        );
        Ok(best)
    }

    /// Try every cut index, memorizing messages as their outlines are needed.
    async fn scan(
        &self,
        conversation: &Conversation,
        init: &[Chat],
        rest: &mut [MessageRecord],
        budget: usize,
    ) -> Result<Scan> {
        'rescan: loop {
            let mut smallest: Option<Vec<Chat>> = None;
            for cut in 0..rest.len() {
                if cut > 0 && rest[cut - 1].meta.outline.is_none() {
                    // Cutting past this message needs its outline.
                    let last = rest.len() - 1;
                    rest[cut - 1] = self.to_memory(conversation, &rest[cut - 1]).await?;
                    if rest[last].meta.outline.is_none() {
                        rest[last] = self.to_memory(conversation, &rest[last]).await?;
                    }
                    continue 'rescan;
                }
                let candidate = build_candidate(init, rest, cut);
                if count_chats(&candidate) <= budget {
                    return Ok(Scan::Fits(candidate));
                }
                if smallest
                    .as_ref()
                    .is_none_or(|s| count_chats(&candidate) < count_chats(s))
                {
                    smallest = Some(candidate);
                }
            }
            // Every cut tried; summarizing the most recent message may still help.
            let last = rest.len() - 1;
            if rest[last].meta.outline.is_none() {
                rest[last] = self.to_memory(conversation, &rest[last]).await?;
                continue 'rescan;
            }
            return Ok(Scan::Overflows(smallest.unwrap_or_else(|| init.to_vec())));
        }
    }

    fn skips_memorization(&self, record: &MessageRecord) -> bool {
        let meta = &record.meta;
        let action = record.action();
        meta.control
            || meta.is_initial
            || meta.deleted
            || action.is_some_and(|a| self.config.excluded_actions.iter().any(|e| e == a))
            || (record.chat.role() != Role::User && action.is_none())
    }

    /// Derive and persist the outline and chat summary of `record`, filing its content into
    /// the conversation's memory store when there is one. Returns the updated record.
    pub async fn to_memory(
        &self,
        conversation: &Conversation,
        record: &MessageRecord,
    ) -> Result<MessageRecord> {
        if record.meta.outline.is_some() {
            return Ok(record.clone());
        }
        let message = Message::open(conversation.registry(), record.id())?;

        if self.skips_memorization(record) {
            let chat = record.chat.clone();
            return message.update_meta(|meta| {
                meta.outline = Some(String::new());
                meta.chat_summary = Some(chat);
            });
        }

        let filed = match conversation.memory() {
            Some(memory) => {
                let context_size = conversation.context_size()?;
                let scope = record.conversation_id().unwrap_or(conversation.id());
                let source = format!("message:{}", record.id());
                let document = record.chat.render();
                let large = record.tokens() as f64 > context_size as f64 * self.config.memorize_ratio;

                let result = if large {
                    memory
                        .ingest(&document, &source, scope, false)
                        .await
                        .map(|fragments| {
                            let titles: Vec<&str> =
                                fragments.iter().map(|f| f.memory.title.as_str()).collect();
                            let outline = titles.join("; ");
                            let blurb = format!(
                                "[{} message filed into memory as: {outline}. Use find_memory to recall the details.]",
                                record.chat.role()
                            );
                            (
                                outline,
                                record.chat.with_content(blurb),
                                fragments.iter().map(|f| f.id.clone()).collect::<Vec<_>>(),
                            )
                        })
                } else {
                    memory
                        .add_memory(&document, &source, scope)
                        .await
                        .map(|fragment| {
                            (fragment.memory.title, record.chat.clone(), vec![fragment.id])
                        })
                };
                conversation.registry().checkpoint(conversation.path())?;

                match result.map_err(Error::from) {
                    Ok(filed) => Some(filed),
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            message = %record.id(),
                            error = %err,
                            "memorizing message failed, outlining its first line"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        match filed {
            Some((outline, summary, memories)) => {
                tracing::debug!(message = %record.id(), memories = memories.len(), "message memorized");
                message.update_meta(|meta| {
                    meta.outline = Some(outline);
                    meta.chat_summary = Some(summary);
                    meta.memories = memories;
                })
            }
            None => {
                let outline = first_line_outline(&record.chat);
                message.update_meta(|meta| meta.outline = Some(outline))
            }
        }
    }
}

/// Initial turns, then the outlines of `rest[..cut]`, then `rest[cut..]`.
fn build_candidate(init: &[Chat], rest: &[MessageRecord], cut: usize) -> Vec<Chat> {
    let mut chats = init.to_vec();
    let outlines: Vec<&str> = rest[..cut]
        .iter()
        .filter_map(|m| m.meta.outline.as_deref())
        .filter(|o| !o.is_empty())
        .collect();
    if !outlines.is_empty() {
        let mut text = EARLIER_TOPICS.to_string();
        for outline in outlines {
            text.push_str("\n- ");
            text.push_str(outline);
        }
        chats.push(Chat::system(text));
    }
    chats.extend(rest[cut..].iter().map(|m| m.summary_or_chat().clone()));
    chats
}

/// The first non-empty line of a turn, shortened, prefixed with its role.
fn first_line_outline(chat: &Chat) -> String {
    let line = chat
        .content()
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .or_else(|| chat.action().map(|a| format!("called {a}")))
        .unwrap_or_default();
    let mut outline: String = line.chars().take(OUTLINE_CHARS).collect();
    if outline.len() < line.len() {
        outline.push_str("...");
    }
    format!("{}: {outline}", chat.role())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MessageMeta;

    fn record(chat: Chat, outline: Option<&str>) -> MessageRecord {
        MessageRecord {
            chat,
            meta: MessageMeta {
                outline: outline.map(str::to_string),
                ..MessageMeta::default()
            },
            path: vec!["root".into(), "c".into(), "m".into()],
        }
    }

    #[test]
    fn candidate_lists_non_empty_outlines() {
        let init = vec![Chat::system("sys")];
        let rest = vec![
            record(Chat::user("first question"), Some("user: first question")),
            record(Chat::assistant("answer"), Some("")),
            record(Chat::user("latest"), None),
        ];
        let chats = build_candidate(&init, &rest, 2);
        assert_eq!(chats.len(), 3);
        assert!(chats[1].content().contains("- user: first question"));
        assert_eq!(chats[2], Chat::user("latest"));

        let uncut = build_candidate(&init, &rest, 0);
        assert_eq!(uncut.len(), 4);
    }

    #[test]
    fn outline_is_first_line_truncated() {
        let long = "x".repeat(500);
        let outline = first_line_outline(&Chat::user(format!("\n{long}\nmore")));
        assert!(outline.starts_with("user: xxx"));
        assert!(outline.ends_with("..."));
        assert!(outline.len() < 140);

        let call = Chat::Assistant {
            content: String::new(),
            function_call: Some(crate::chat::FunctionCall {
                name: "find_memory".into(),
                arguments: "{}".into(),
            }),
        };
        assert_eq!(first_line_outline(&call), "assistant: called find_memory");
    }

    #[test]
    fn skip_policy() {
        let fitter = ContextFitter::new(ContextConfig::default());
        assert!(fitter.skips_memorization(&record(Chat::assistant("plain"), None)));
        assert!(!fitter.skips_memorization(&record(Chat::user("hi"), None)));
        assert!(fitter.skips_memorization(&record(Chat::function("return", "x"), None)));
        assert!(!fitter.skips_memorization(&record(Chat::function("find_memory", "x"), None)));

        let mut initial = record(Chat::user("seed"), None);
        initial.meta.is_initial = true;
        assert!(fitter.skips_memorization(&initial));
    }
}
