//! Message routing for copilot-hub.
//!
//! Handles:
//! - Target selection (broadcast, round-robin, targeted)
//! - Named message transforms
//! - Per-target delivery through the presentation sink
//!
//! The router decides *who* sees a message, never *when* a reply happens.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::participant::{Delivery, DeliveryError, ParticipantDirectory, PresentationSink};

use super::conversation::{ConversationView, Role};
use super::events::{EventBus, HubEvent};

/// How delivery targets are chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Every member except the sender.
    Broadcast,
    /// The single member at the turn cursor, among members other than the sender.
    RoundRobin,
    /// An explicit allow-list, narrowed to current members other than the sender.
    Targeted(Vec<String>),
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Broadcast => "broadcast",
            Strategy::RoundRobin => "round-robin",
            Strategy::Targeted(_) => "targeted",
        }
    }
}

/// What a transform gets to look at besides the message.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub conversation_id: &'a str,
    pub sender_id: Option<&'a str>,
    pub role: Role,
}

/// A pure message rewrite. An `Err` leaves the message unchanged.
pub type TransformFn =
    Arc<dyn Fn(&str, &TransformContext<'_>) -> Result<String, String> + Send + Sync>;

/// Per-call routing options.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Excluded from the targets when set
    pub sender: Option<String>,
    pub strategy: Strategy,
    /// Name of a registered transform
    pub transform: Option<String>,
    pub role: Role,
    /// Author label shown with the message
    pub author: Option<String>,
}

impl RouteOptions {
    /// A user message, broadcast to everyone but its sender.
    pub fn user(sender_id: &str) -> Self {
        Self {
            sender: Some(sender_id.to_string()),
            strategy: Strategy::Broadcast,
            transform: None,
            role: Role::User,
            author: Some(sender_id.to_string()),
        }
    }

    /// An assistant message, broadcast to every member.
    pub fn assistant(author: Option<&str>) -> Self {
        Self {
            sender: None,
            strategy: Strategy::Broadcast,
            transform: None,
            role: Role::Assistant,
            author: author.map(str::to_string),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_transform(mut self, name: &str) -> Self {
        self.transform = Some(name.to_string());
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }
}

/// Outcome of delivering to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The target could not be resolved.
    Missing,
    /// The sink refused the message.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub target_id: String,
    pub outcome: DeliveryOutcome,
}

/// What happened to a routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingResult {
    /// The message after transforms
    pub message: String,
    pub targets: Vec<String>,
    pub results: Vec<DeliveryResult>,
}

impl RoutingResult {
    pub fn delivered(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Delivered)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered()
    }
}

/// Delivers messages to conversation members.
pub struct MessageRouter {
    directory: Arc<dyn ParticipantDirectory>,
    sink: Arc<dyn PresentationSink>,
    events: EventBus,
    transforms: RwLock<HashMap<String, TransformFn>>,
}

impl MessageRouter {
    pub fn new(
        directory: Arc<dyn ParticipantDirectory>,
        sink: Arc<dyn PresentationSink>,
        events: EventBus,
    ) -> Self {
        Self {
            directory,
            sink,
            events,
            transforms: RwLock::new(HashMap::new()),
        }
    }

    /// Register a named transform, replacing any previous one.
    pub fn register_transform<F>(&self, name: &str, transform: F)
    where
        F: Fn(&str, &TransformContext<'_>) -> Result<String, String> + Send + Sync + 'static,
    {
        self.transforms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(transform));
    }

    /// Names of the registered transforms.
    pub fn transforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .transforms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Compute the delivery targets for a strategy.
    pub fn targets(
        &self,
        conversation: &ConversationView,
        sender: Option<&str>,
        strategy: &Strategy,
    ) -> Vec<String> {
        let others: Vec<String> = conversation
            .members
            .iter()
            .filter(|m| Some(m.as_str()) != sender)
            .cloned()
            .collect();

        match strategy {
            Strategy::Broadcast => others,
            Strategy::RoundRobin => {
                if others.is_empty() {
                    return Vec::new();
                }
                vec![others[conversation.turn_cursor % others.len()].clone()]
            }
            Strategy::Targeted(allow) => {
                // Allow-list order, first mention wins.
                let mut targets: Vec<String> = Vec::new();
                for id in allow {
                    if others.contains(id) && !targets.contains(id) {
                        targets.push(id.clone());
                    }
                }
                targets
            }
        }
    }

    /// Transform a message, pick its targets and deliver it to each of them.
    pub fn route(
        &self,
        conversation: &ConversationView,
        message: &str,
        options: &RouteOptions,
    ) -> RoutingResult {
        let context = TransformContext {
            conversation_id: &conversation.id,
            sender_id: options.sender.as_deref(),
            role: options.role,
        };
        let message = self.apply_transform(message, options.transform.as_deref(), &context);

        let targets = self.targets(conversation, options.sender.as_deref(), &options.strategy);

        let results: Vec<DeliveryResult> = targets
            .iter()
            .map(|target_id| {
                let delivery = Delivery {
                    target_id: target_id.clone(),
                    message: message.clone(),
                    role: options.role,
                    author: options.author.clone(),
                    via: Some(conversation.id.clone()),
                };
                DeliveryResult {
                    target_id: target_id.clone(),
                    outcome: self.send_to_target(&delivery),
                }
            })
            .collect();

        let result = RoutingResult {
            message,
            targets,
            results,
        };

        tracing::debug!(
            "Routed {} message in {} via {} to {} target(s), {} failed",
            options.role,
            conversation.id,
            options.strategy.name(),
            result.targets.len(),
            result.failed()
        );

        self.events.emit(HubEvent::MessageRouted {
            conversation_id: conversation.id.clone(),
            role: options.role,
            targets: result.targets.clone(),
            failed: result.failed(),
        });

        result
    }

    fn apply_transform(&self, message: &str, name: Option<&str>, context: &TransformContext<'_>) -> String {
        let name = match name {
            Some(n) if n != "default" => n,
            _ => return message.to_string(),
        };

        let transform = self
            .transforms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();

        match transform {
            Some(f) => match f(message, context) {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!("Transform '{}' failed, passing message through: {}", name, e);
                    message.to_string()
                }
            },
            None => {
                tracing::warn!("Unknown message transform: {}", name);
                message.to_string()
            }
        }
    }

    fn send_to_target(&self, delivery: &Delivery) -> DeliveryOutcome {
        if self.directory.lookup(&delivery.target_id).is_none() {
            tracing::warn!("Target participant not found: {}", delivery.target_id);
            return DeliveryOutcome::Missing;
        }

        match self.sink.deliver(delivery) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(DeliveryError::TargetMissing(id)) => {
                tracing::warn!("Sink has no view for {}", id);
                DeliveryOutcome::Missing
            }
            Err(e) => {
                tracing::warn!("Failed to deliver to {}: {}", delivery.target_id, e);
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }
}
