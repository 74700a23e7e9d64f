//! Adapter interfaces for external systems.
//!
//! Stage invokers call the opaque dataset/train/deploy capabilities; the
//! subscriber adapters relay terminal outcomes to chat channels.

pub mod command;
pub mod http;
pub mod telegram;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{StagePayload, StageResult};

pub use command::CommandInvoker;
pub use http::HttpInvoker;
pub use telegram::{TelegramConfig, TelegramSubscriber};
pub use webhook::WebhookSubscriber;

/// Trait for the capability behind a single stage
///
/// Invokers are stateless: the executor may call the same invoker any number
/// of times, from any number of runs. Per-attempt timeouts are enforced by the
/// caller, which drops the returned future when the bound is exceeded.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Human-readable invoker name
    fn name(&self) -> &str;

    /// Run the stage against the given payload
    async fn invoke(&self, payload: &StagePayload) -> StageResult;
}

/// How a stage is reached, as written in workflow YAML
///
/// ```yaml
/// invoker:
///   command:
///     program: ./stages/train.sh
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokerSpec {
    /// Local program: JSON payload on stdin, JSON result on stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },

    /// Remote function: JSON payload POSTed, JSON result in the body
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Instantiate the invoker described by a spec
pub fn invoker_from_spec(spec: &InvokerSpec) -> Arc<dyn StageInvoker> {
    match spec {
        InvokerSpec::Command { program, args, env } => Arc::new(
            CommandInvoker::new(program.clone())
                .with_args(args.clone())
                .with_env(env.clone()),
        ),
        InvokerSpec::Http { url, headers } => {
            Arc::new(HttpInvoker::new(url.clone()).with_headers(headers.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoker_spec_yaml() {
        let spec: InvokerSpec = serde_yaml::from_str(
            r#"
command:
  program: python3
  args: [stages/train.py]
"#,
        )
        .unwrap();

        assert_eq!(
            spec,
            InvokerSpec::Command {
                program: "python3".to_string(),
                args: vec!["stages/train.py".to_string()],
                env: HashMap::new(),
            }
        );
        assert_eq!(invoker_from_spec(&spec).name(), "python3");
    }

    #[test]
    fn test_http_spec_builds_http_invoker() {
        let spec = InvokerSpec::Http {
            url: "http://localhost:9000/deploy".to_string(),
            headers: HashMap::new(),
        };

        assert_eq!(invoker_from_spec(&spec).name(), "http://localhost:9000/deploy");
    }
}
