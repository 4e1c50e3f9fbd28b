//! Directory membership records.
//!
//! A `DirectoryInfo` names a resource plus the set of `(name, node)` members
//! that have joined it. The whole record round-trips through url-option form
//! (`&info=..&min_members=..&num=N&m0=<name>,<hex>`), which is how it travels
//! in directory-manager requests and replies.

use crate::nodeid::{NodeId, NODE_UNSPECIFIED};
use crate::url::ResourceUrl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAndNode {
    pub name: String,
    pub node: NodeId,
}

impl NameAndNode {
    pub fn new(name: &str, node: NodeId) -> Self {
        NameAndNode { name: name.to_string(), node }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryInfo {
    pub url: ResourceUrl,
    pub info: String,
    pub min_members: u32,
    pub members: Vec<NameAndNode>,
}

impl DirectoryInfo {
    pub fn new(url: ResourceUrl) -> Self {
        DirectoryInfo { url, info: String::new(), min_members: 0, members: Vec::new() }
    }

    /// Unpack a record that was serialized into url options
    /// (`info`, `min_members`, `num`, `ag0..agN-1`).
    pub fn from_url(mut url: ResourceUrl) -> Self {
        let info = url
            .remove_option("info")
            .map(|s| crate::url::percent_decode(&s))
            .unwrap_or_default();

        let min_members = url
            .remove_option("min_members")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        let mut members = Vec::new();
        if let Some(s) = url.remove_option("num") {
            if let Ok(num) = s.parse::<usize>() {
                for i in 0..num {
                    let key = format!("m{}", i);
                    if let Some(entry) = url.remove_option(&key) {
                        // entry is "<name>,<hex node>"
                        if let Some((name, hex)) = entry.split_once(',') {
                            if let Some(node) = NodeId::from_hex(hex) {
                                members.push(NameAndNode::new(name, node));
                            }
                        }
                    }
                }
            }
        }

        DirectoryInfo { url, info, min_members, members }
    }

    /// Serialize into a url whose options carry the whole record.
    pub fn to_url(&self) -> ResourceUrl {
        let mut url = self.url.clone();
        if !self.info.is_empty() {
            url.set_option("info", &crate::url::percent_encode_component(&self.info));
        }
        if self.min_members > 0 {
            url.set_option("min_members", &self.min_members.to_string());
        }
        url.set_option("num", &self.members.len().to_string());
        for (i, m) in self.members.iter().enumerate() {
            url.set_option(&format!("m{}", i), &format!("{},{}", m.name, m.node.to_hex()));
        }
        url
    }

    /// True when no field holds a value ("no info available").
    pub fn is_empty(&self) -> bool {
        self.url.is_empty()
            && self.info.is_empty()
            && self.min_members == 0
            && self.members.is_empty()
    }

    /// A directory is usable once enough members have joined.
    pub fn is_viable(&self) -> bool {
        self.members.len() as u32 >= self.min_members
    }

    pub fn get_child_reference_node(&self, child_name: &str) -> Option<NodeId> {
        self.members
            .iter()
            .find(|m| m.name == child_name)
            .map(|m| m.node)
    }

    pub fn get_child_name_by_node(&self, node: NodeId) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.node == node)
            .map(|m| m.name.as_str())
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.members.iter().any(|m| m.node == node)
    }

    /// Join a node under `reference_name`, or under a generated `ag<hex>`
    /// name when the given name is empty. Returns the name actually used,
    /// or None when the requested name is already taken.
    pub fn join(&mut self, node: NodeId, reference_name: &str) -> Option<String> {
        let new_name = if !reference_name.is_empty() {
            if self.members.iter().any(|m| m.name == reference_name) {
                return None;
            }
            reference_name.to_string()
        } else {
            // jump ahead to make a better first guess
            let mut i = self.members.len();
            loop {
                let candidate = format!("ag{:x}", i);
                if !self.members.iter().any(|m| m.name == candidate) {
                    break candidate;
                }
                i += 1;
            }
        };
        self.members.push(NameAndNode::new(&new_name, node));
        Some(new_name)
    }

    /// Remove by the child url's name, falling back to its reference node.
    pub fn leave(&mut self, child_url: &ResourceUrl) -> bool {
        self.leave_by_name(&child_url.name) || self.leave_by_node(child_url.reference_node)
    }

    pub fn leave_by_name(&mut self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if let Some(pos) = self.members.iter().position(|m| m.name == name) {
            self.members.remove(pos);
            true
        } else {
            false
        }
    }

    /// Removes only the first match.
    pub fn leave_by_node(&mut self, node: NodeId) -> bool {
        if node == NODE_UNSPECIFIED {
            return false;
        }
        if let Some(pos) = self.members.iter().position(|m| m.node == node) {
            self.members.remove(pos);
            true
        } else {
            false
        }
    }
}
