//! Session tree assembly across instances.
//!
//! Each session's statistics carry its subsession links; the tree builder
//! descends them recursively, resolving every child in the instance its
//! link names. Links refer to sessions by id only, so traversal is always
//! id -> lookup; a visited set breaks reference cycles and `max_depth`
//! truncates regardless.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::instance;
use crate::session::message::RecordedMessage;
use crate::session::meta::{SessionMetadata, SessionStatistics};
use crate::session::session::{METADATA_FILE, STATISTICS_FILE, read_messages};
use crate::utils::file_ops::read_json;

#[derive(Debug, Clone, Serialize)]
pub struct SessionTree {
    pub session_id: String,
    pub instance_name: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<SessionStatistics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<RecordedMessage>,
    pub subsessions: Vec<SessionTree>,
    /// Set when the node could not be loaded; the subtree below it is
    /// unknown, not empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlatNode {
    pub session_id: String,
    pub instance_name: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn build_session_tree(
    instances_root: &Path,
    session_id: &str,
    instance_name: &str,
    include_messages: bool,
    max_depth: usize,
) -> Result<SessionTree> {
    let mut visited = HashSet::new();
    build_node(
        instances_root,
        session_id,
        instance_name,
        include_messages,
        max_depth,
        &mut visited,
    )
}

fn build_node(
    instances_root: &Path,
    session_id: &str,
    instance_name: &str,
    include_messages: bool,
    remaining_depth: usize,
    visited: &mut HashSet<String>,
) -> Result<SessionTree> {
    visited.insert(session_id.to_string());

    let session_dir = instances_root
        .join(instance_name)
        .join(instance::SESSIONS_DIR)
        .join(session_id);

    let metadata: SessionMetadata = read_json(&session_dir.join(METADATA_FILE))?;
    let statistics: Option<SessionStatistics> =
        read_json(&session_dir.join(STATISTICS_FILE)).ok();

    let messages = if include_messages {
        read_messages(&session_dir, None, None).unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut node = SessionTree {
        session_id: session_id.to_string(),
        instance_name: metadata.instance_name.clone(),
        depth: metadata.depth,
        metadata: Some(metadata),
        statistics: statistics.clone(),
        messages,
        subsessions: Vec::new(),
        error: None,
    };

    if remaining_depth == 0 {
        return Ok(node);
    }

    let links = statistics.map(|stats| stats.subsessions).unwrap_or_default();
    for link in links {
        if link.session_id.is_empty() || visited.contains(&link.session_id) {
            continue;
        }

        // The link records where the child lives; fall back to scanning
        // the instances root for links written before the adapter learned
        // the child's instance.
        let child_instance = if link.instance_name.is_empty() {
            match instance::infer_instance_name(&link.session_id, instances_root) {
                Some(name) => name,
                None => {
                    warn!(child = %link.session_id, tool = %link.tool_name, "Cannot locate child session's instance");
                    continue;
                }
            }
        } else {
            link.instance_name.clone()
        };

        match build_node(
            instances_root,
            &link.session_id,
            &child_instance,
            include_messages,
            remaining_depth - 1,
            visited,
        ) {
            Ok(child) => node.subsessions.push(child),
            Err(e) => {
                warn!(child = %link.session_id, error = %e, "Failed to build child subtree");
                node.subsessions.push(SessionTree {
                    session_id: link.session_id.clone(),
                    instance_name: child_instance,
                    depth: node.depth + 1,
                    metadata: None,
                    statistics: None,
                    messages: Vec::new(),
                    subsessions: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    Ok(node)
}

/// Pre-order flattening of a tree, depth annotated per node.
pub fn flatten_tree(tree: &SessionTree) -> Vec<FlatNode> {
    let mut nodes = Vec::new();
    flatten_into(tree, &mut nodes);
    nodes
}

fn flatten_into(node: &SessionTree, out: &mut Vec<FlatNode>) {
    out.push(FlatNode {
        session_id: node.session_id.clone(),
        instance_name: node.instance_name.clone(),
        depth: node.depth,
        error: node.error.clone(),
    });
    for child in &node.subsessions {
        flatten_into(child, out);
    }
}

impl SessionTree {
    pub fn flatten(&self) -> Vec<FlatNode> {
        flatten_tree(self)
    }

    pub fn node_count(&self) -> usize {
        1 + self
            .subsessions
            .iter()
            .map(SessionTree::node_count)
            .sum::<usize>()
    }
}
