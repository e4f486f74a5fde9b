//! Action registry: maps the subject command to a named action.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Fault;
use crate::handler::MessageHandler;
use crate::models::{Content, Contents, Tag, User};

/// Action body: receives the requesting user and the request's text and
/// returns markdown reply text.
pub type ActionFn = Arc<dyn Fn(&User, &str) -> Result<String, Fault> + Send + Sync>;

const BANNER: &str = r"
 __  __       _ _    ____       _
|  \/  | __ _(_) |  / ___| __ _| |_ _____      ____ _ _   _
| |\/| |/ _` | | | | |  _ / _` | __/ _ \ \ /\ / / _` | | | |
| |  | | (_| | | | | |_| | (_| | ||  __/\ V  V / (_| | |_| |
|_|  |_|\__,_|_|_|  \____|\__,_|\__\___| \_/\_/ \__,_|\__, |
                                                      |___/";

/// Registry of actions addressable by any of their aliases.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(&["Hello-World", "HelloWorld", "Hello World"], |user, _| {
            Ok(format!(
                "```\n{BANNER}\n```\n\nHello, {}! This mailbox answers commands sent in the subject line.",
                user.name
            ))
        });
        registry
    }

    /// Register an action under one or more aliases. Later registrations
    /// replace earlier ones with the same alias.
    pub fn register<F>(&mut self, aliases: &[&str], action: F)
    where
        F: Fn(&User, &str) -> Result<String, Fault> + Send + Sync + 'static,
    {
        let action: ActionFn = Arc::new(action);
        for alias in aliases {
            let key = normalize(alias);
            if self.actions.insert(key, Arc::clone(&action)).is_some() {
                tracing::debug!(alias = %alias, "Replaced action");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(&normalize(name)).cloned()
    }

    pub fn count(&self) -> usize {
        self.actions.len()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[async_trait]
impl MessageHandler for ActionRegistry {
    async fn handle(
        &self,
        _user_id: &str,
        request_id: &str,
        user: &User,
        contents: Contents,
    ) -> Result<Contents, Fault> {
        let command = contents
            .iter()
            .find(|c| c.tag() == Tag::Command)
            .and_then(|c| c.as_text())
            .ok_or_else(|| Fault::normal("Invalid command"))?;

        let action = self
            .get(command)
            .ok_or_else(|| Fault::normal("Invalid command"))?;

        let text: Vec<&str> = contents
            .iter()
            .filter(|c| c.tag() == Tag::Body && !matches!(c, Content::File { .. }))
            .filter_map(|c| c.as_text())
            .collect();

        tracing::debug!(request_id = %request_id, command = %command, "Running action");
        let reply = action(user, &text.join("\n"))?;
        Ok(vec![Content::markdown(Tag::Body, reply)])
    }
}
