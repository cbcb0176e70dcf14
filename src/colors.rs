//! Display colors for captured messages.
//!
//! Colors are assigned per client identity, round-robin over a fixed palette, and
//! stay stable for the lifetime of the [`ColorAssignor`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::allproxy_core::{Message, Protocol};

pub const PALETTE: [&str; 7] =
    ["green", "purple", "blue", "brown", "darkpink", "slateblue", "darkorange"];

pub const BROWSER_COLOR: &str = "orangered";
pub const AGENT_COLOR: &str = "black";
pub const LOG_COLOR: &str = "#007bff";
pub const ERROR_COLOR: &str = "red";

/// Client key that always renders as [`ERROR_COLOR`].
pub const ERROR_KEY: &str = "error";

const NON_INTERACTIVE_AGENTS: [&str; 12] = [
    "curl",
    "wget",
    "httpie",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "axios",
    "node-fetch",
    "go-http-client",
    "okhttp",
    "java/",
    "bot",
];

#[derive(Debug, Default)]
struct Assignments {
    by_key: HashMap<String, &'static str>,
    next: usize,
}

#[derive(Debug, Default)]
pub struct ColorAssignor {
    assignments: Mutex<Assignments>,
}

impl ColorAssignor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_of(&self, message: &Message) -> &'static str {
        match message.protocol {
            Protocol::Browser => {
                if is_interactive_agent(message.header("user-agent")) {
                    BROWSER_COLOR
                } else {
                    AGENT_COLOR
                }
            }
            Protocol::Log => LOG_COLOR,
            _ => self.color_for_key(message.client_identity.as_deref().map(str::trim).unwrap_or("")),
        }
    }

    pub fn color_for_key(&self, key: &str) -> &'static str {
        if key == ERROR_KEY {
            return ERROR_COLOR;
        }
        // A poisoned map still holds valid assignments.
        let mut assignments = match self.assignments.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(color) = assignments.by_key.get(key) {
            return color;
        }
        let color = PALETTE[assignments.next % PALETTE.len()];
        assignments.next += 1;
        assignments.by_key.insert(key.to_string(), color);
        color
    }
}

fn is_interactive_agent(user_agent: Option<&str>) -> bool {
    let Some(agent) = user_agent.map(str::trim).filter(|agent| !agent.is_empty()) else {
        return false;
    };
    let lower = agent.to_ascii_lowercase();
    if NON_INTERACTIVE_AGENTS.iter().any(|needle| lower.contains(needle))
        || lower.contains("spider")
        || lower.contains("crawler")
    {
        return false;
    }
    lower.starts_with("mozilla/")
}
