//! Unified tool namespace across sessions.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::model::ToolDescriptor;
use crate::pool::SessionHandle;
use crate::{Error, Result};

/// A tool with the session that serves it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub owner: SessionHandle,
}

/// Merges per-session catalogs and routes tool names to sessions.
///
/// Names are unique. When two sessions register the same name, the later
/// registration takes ownership and its descriptor replaces the earlier one
/// in place.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    catalog: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, owner: SessionHandle, descriptors: Vec<ToolDescriptor>) {
        for descriptor in descriptors {
            let entry = RegisteredTool {
                descriptor: descriptor.clone(),
                owner,
            };
            match self.by_name.get(&descriptor.name) {
                Some(&index) => {
                    let previous = self.tools[index].owner;
                    warn!(
                        tool = %descriptor.name,
                        %previous,
                        %owner,
                        "tool name registered twice, later session takes it"
                    );
                    self.tools[index] = entry;
                    self.catalog[index] = descriptor;
                }
                None => {
                    debug!(tool = %descriptor.name, %owner, "registered tool");
                    self.by_name
                        .insert(descriptor.name.clone(), self.tools.len());
                    self.tools.push(entry);
                    self.catalog.push(descriptor);
                }
            }
        }
    }

    /// Tools handed to the model, in registration order.
    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    pub fn owner_of(&self, name: &str) -> Result<SessionHandle> {
        self.by_name
            .get(name)
            .map(|&index| self.tools[index].owner)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.by_name.get(name).map(|&index| &self.tools[index])
    }

    /// Drop every tool owned by a session that is gone.
    ///
    /// Returns the number of tools removed.
    pub fn retire(&mut self, session: SessionHandle) -> usize {
        let before = self.tools.len();
        self.tools.retain(|tool| tool.owner != session);
        let removed = before - self.tools.len();
        if removed > 0 {
            self.reindex();
            debug!(%session, removed, "retired tools of closed session");
        }
        removed
    }

    pub fn tools(&self) -> &[RegisteredTool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn reindex(&mut self) {
        self.catalog = self.tools.iter().map(|t| t.descriptor.clone()).collect();
        self.by_name = self
            .tools
            .iter()
            .enumerate()
            .map(|(index, t)| (t.descriptor.name.clone(), index))
            .collect();
    }
}
