//! The deliverer interface and a small set of built-in implementations.
//!
//! `deliver` is only ever called directly, in-process, for
//! [`DeliveryKind::InChild`] deliverers — `AsUser` and `WriteBack` are
//! dispatched across the privilege boundary by `empath-parent`, which owns
//! the only code path allowed to invoke them (§4.4, §6).

use std::{collections::HashMap, sync::Arc};

use crate::mail::Mail;

/// Where a deliverer is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Safe to run in the unprivileged child.
    InChild,
    /// Must run as a specific uid in the privileged parent.
    AsUser,
    /// Runs as a specific uid in the parent and returns a replacement body.
    WriteBack,
}

/// Implemented by every deliverer.
pub trait Deliverer: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> DeliveryKind;

    /// Perform the delivery. For a [`DeliveryKind::WriteBack`] deliverer,
    /// a successful return additionally yields the replacement body via
    /// `mail.replace_body` — the caller is responsible for passing that
    /// body back to the child over IPC (`empath-parent`'s job, not this
    /// crate's).
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::DelivererFailed`] on any failure.
    fn deliver(&self, mail: &mut Mail, config: &str) -> crate::Result<()>;

    fn describe(&self, config: &str) -> String {
        format!("{}({config})", self.name())
    }
}

/// Adds or overwrites a tag. `config` has the shape `key=value`.
pub struct TagDeliverer;

impl Deliverer for TagDeliverer {
    fn name(&self) -> &str {
        "tag"
    }

    fn kind(&self) -> DeliveryKind {
        DeliveryKind::InChild
    }

    fn deliver(&self, mail: &mut Mail, config: &str) -> crate::Result<()> {
        let (key, value) = config.split_once('=').ok_or_else(|| crate::CoreError::DelivererFailed {
            deliverer: self.name().into(),
            reason: format!("malformed tag deliverer config: {config}"),
        })?;
        mail.tags_mut().insert(key, value);
        Ok(())
    }
}

/// Marks the message dropped. Takes no configuration.
pub struct DiscardDeliverer;

impl Deliverer for DiscardDeliverer {
    fn name(&self) -> &str {
        "discard"
    }

    fn kind(&self) -> DeliveryKind {
        DeliveryKind::InChild
    }

    fn deliver(&self, mail: &mut Mail, _config: &str) -> crate::Result<()> {
        mail.set_decision(crate::mail::Decision::Drop);
        Ok(())
    }
}

/// Writes the message to a path owned by the recipient uid. Only ever
/// invoked on the privileged side; `config` is the destination path.
pub struct WriteDeliverer;

impl Deliverer for WriteDeliverer {
    fn name(&self) -> &str {
        "write"
    }

    fn kind(&self) -> DeliveryKind {
        DeliveryKind::AsUser
    }

    fn deliver(&self, mail: &mut Mail, config: &str) -> crate::Result<()> {
        std::fs::write(config, mail.body()).map_err(|e| crate::CoreError::DelivererFailed {
            deliverer: self.name().into(),
            reason: e.to_string(),
        })
    }
}

/// Rewrites the message body, e.g. stripping a banner or adding one.
/// `config` has the shape `prepend:<text>`; only ever invoked on the
/// privileged side.
pub struct RewriteDeliverer;

impl Deliverer for RewriteDeliverer {
    fn name(&self) -> &str {
        "rewrite"
    }

    fn kind(&self) -> DeliveryKind {
        DeliveryKind::WriteBack
    }

    fn deliver(&self, mail: &mut Mail, config: &str) -> crate::Result<()> {
        let prefix = config.strip_prefix("prepend:").ok_or_else(|| crate::CoreError::DelivererFailed {
            deliverer: self.name().into(),
            reason: format!("malformed rewrite deliverer config: {config}"),
        })?;
        let rewritten = format!("{prefix}{}", mail.body());
        mail.replace_body(rewritten);
        Ok(())
    }
}

/// Looks deliverers up by the name recorded on an action item at config
/// load time.
#[derive(Clone, Default)]
pub struct DelivererRegistry {
    deliverers: HashMap<String, Arc<dyn Deliverer>>,
}

impl DelivererRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TagDeliverer));
        registry.register(Arc::new(DiscardDeliverer));
        registry.register(Arc::new(WriteDeliverer));
        registry.register(Arc::new(RewriteDeliverer));
        registry
    }

    pub fn register(&mut self, deliverer: Arc<dyn Deliverer>) {
        self.deliverers.insert(deliverer.name().to_string(), deliverer);
    }

    /// # Errors
    ///
    /// Returns [`crate::CoreError::UnknownDeliverer`] if no deliverer is
    /// registered under `name`.
    pub fn get(&self, name: &str) -> crate::Result<Arc<dyn Deliverer>> {
        self.deliverers
            .get(name)
            .cloned()
            .ok_or_else(|| crate::CoreError::UnknownDeliverer(name.to_string()))
    }
}
