//! Window Hierarchy
//!
//! The core only queries the hierarchy (parent, ancestry, stacking order,
//! viewability) plus the few mutations a close-down needs for save-set
//! rescue. [`WindowTree`] is the in-memory provider used by the binary and
//! the tests.

use std::collections::HashMap;

use tracing::debug;

use crate::dix::Server;
use crate::dix::error::DixError;
use crate::dix::event::{EventKind, EventRun, LogicalEvent, StructureKind};
use crate::dix::flags::EventMask;
use crate::dix::resource::{ClientId, ResourceKind, WindowId};

/// Window hierarchy provider.
pub trait WindowHierarchy: Send {
    fn root(&self) -> WindowId;

    fn contains(&self, window: WindowId) -> bool;

    fn parent(&self, window: WindowId) -> Option<WindowId>;

    /// Children from top of the stack to bottom. Stable for one delivery pass.
    fn ordered_children(&self, window: WindowId) -> Vec<WindowId>;

    /// Mapped, and every ancestor mapped.
    fn is_viewable(&self, window: WindowId) -> bool;

    /// Strict ancestry: a window is not its own ancestor.
    fn ancestor_of(&self, ancestor: WindowId, window: WindowId) -> bool {
        let mut current = self.parent(window);
        while let Some(w) = current {
            if w == ancestor {
                return true;
            }
            current = self.parent(w);
        }
        false
    }

    fn create(&mut self, window: WindowId, parent: WindowId) -> bool;

    fn reparent(&mut self, window: WindowId, parent: WindowId) -> bool;

    fn map(&mut self, window: WindowId) -> bool;

    fn unmap(&mut self, window: WindowId) -> bool;

    /// Remove a window and its subtree.
    fn destroy(&mut self, window: WindowId) -> bool;
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<WindowId>,
    /// Bottom of the stack first
    children: Vec<WindowId>,
    mapped: bool,
}

#[derive(Debug, Clone)]
pub struct WindowTree {
    root: WindowId,
    nodes: HashMap<WindowId, Node>,
}

impl WindowTree {
    pub fn new(root: WindowId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                parent: None,
                children: Vec::new(),
                mapped: true,
            },
        );
        Self { root, nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn detach(&mut self, window: WindowId) {
        let parent = self.nodes.get(&window).and_then(|n| n.parent);
        if let Some(node) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            node.children.retain(|c| *c != window);
        }
    }
}

impl WindowHierarchy for WindowTree {
    fn root(&self) -> WindowId {
        self.root
    }

    fn contains(&self, window: WindowId) -> bool {
        self.nodes.contains_key(&window)
    }

    fn parent(&self, window: WindowId) -> Option<WindowId> {
        self.nodes.get(&window).and_then(|n| n.parent)
    }

    fn ordered_children(&self, window: WindowId) -> Vec<WindowId> {
        self.nodes
            .get(&window)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    fn is_viewable(&self, window: WindowId) -> bool {
        let mut current = Some(window);
        while let Some(w) = current {
            match self.nodes.get(&w) {
                Some(node) if node.mapped => current = node.parent,
                _ => return false,
            }
        }
        true
    }

    fn create(&mut self, window: WindowId, parent: WindowId) -> bool {
        if self.nodes.contains_key(&window) {
            return false;
        }
        let Some(node) = self.nodes.get_mut(&parent) else {
            return false;
        };
        node.children.push(window);
        self.nodes.insert(
            window,
            Node {
                parent: Some(parent),
                children: Vec::new(),
                mapped: false,
            },
        );
        true
    }

    fn reparent(&mut self, window: WindowId, parent: WindowId) -> bool {
        if window == self.root
            || !self.nodes.contains_key(&parent)
            || window == parent
            || self.ancestor_of(window, parent)
        {
            return false;
        }
        self.detach(window);
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(window);
        }
        match self.nodes.get_mut(&window) {
            Some(node) => {
                node.parent = Some(parent);
                true
            }
            None => false,
        }
    }

    fn map(&mut self, window: WindowId) -> bool {
        match self.nodes.get_mut(&window) {
            Some(node) => {
                node.mapped = true;
                true
            }
            None => false,
        }
    }

    fn unmap(&mut self, window: WindowId) -> bool {
        match self.nodes.get_mut(&window) {
            Some(node) if window != self.root => {
                node.mapped = false;
                true
            }
            _ => false,
        }
    }

    fn destroy(&mut self, window: WindowId) -> bool {
        if window == self.root || !self.nodes.contains_key(&window) {
            return false;
        }
        self.detach(window);
        let mut stack = vec![window];
        while let Some(w) = stack.pop() {
            if let Some(node) = self.nodes.remove(&w) {
                stack.extend(node.children);
            }
        }
        true
    }
}

impl Server {
    pub fn create_window(
        &mut self,
        client: ClientId,
        window: WindowId,
        parent: WindowId,
    ) -> Result<(), DixError> {
        if !self.tree.contains(parent) {
            return Err(DixError::BadWindow(parent));
        }
        self.directory
            .bind_resource(window, ResourceKind::Window, client)?;
        if !self.tree.create(window, parent) {
            self.directory.unbind(window);
            return Err(DixError::IdInUse(window));
        }
        self.deliver_structure(window, StructureKind::Create, None);
        Ok(())
    }

    /// Destroy a window and its subtree. Destroying the root is a no-op.
    pub fn destroy_window(&mut self, window: WindowId) -> Result<Vec<WindowId>, DixError> {
        if !self.tree.contains(window) {
            return Err(DixError::BadWindow(window));
        }
        if window == self.tree.root() {
            return Ok(Vec::new());
        }
        let destroyed = self.destroy_window_tree(window);
        self.replay_thawed();
        Ok(destroyed)
    }

    /// Notify, unbind and clean up every window under `window`, children
    /// first, then drop the subtree from the hierarchy.
    pub(super) fn destroy_window_tree(&mut self, window: WindowId) -> Vec<WindowId> {
        let mut order = Vec::new();
        let mut stack = vec![(window, false)];
        while let Some((w, expanded)) = stack.pop() {
            if expanded {
                order.push(w);
                continue;
            }
            stack.push((w, true));
            for child in self.tree.ordered_children(w) {
                stack.push((child, false));
            }
        }
        for w in &order {
            self.deliver_structure(*w, StructureKind::Destroy, None);
            if !self.free_resource(*w) {
                self.window_gone(*w);
            }
        }
        self.tree.destroy(window);
        debug!(window = %window, count = order.len(), "window tree destroyed");
        order
    }

    /// Map a window, or hand the request to the client redirecting its
    /// parent's substructure. Returns whether the window was mapped.
    pub fn map_window(&mut self, client: ClientId, window: WindowId) -> Result<bool, DixError> {
        if !self.tree.contains(window) {
            return Err(DixError::BadWindow(window));
        }
        if let Some(parent) = self.tree.parent(window) {
            let request = LogicalEvent::new(
                parent,
                EventKind::Structure {
                    kind: StructureKind::MapRequest,
                    subject: window,
                },
            )
            .at(self.now);
            let redirected = self.maybe_deliver_event_to_client(
                parent,
                &EventRun::single(request),
                EventMask::SUBSTRUCTURE_REDIRECT,
                Some(client),
            );
            if redirected.is_some() {
                return Ok(false);
            }
        }
        self.tree.map(window);
        self.deliver_structure(window, StructureKind::Map, None);
        Ok(true)
    }

    pub fn reparent_window(&mut self, window: WindowId, parent: WindowId) -> Result<(), DixError> {
        let old_parent = self.tree.parent(window).ok_or(DixError::BadWindow(window))?;
        if !self.tree.contains(parent) {
            return Err(DixError::BadWindow(parent));
        }
        if !self.tree.reparent(window, parent) {
            return Err(DixError::BadMatch);
        }
        self.deliver_structure(window, StructureKind::Reparent, Some(old_parent));
        Ok(())
    }

    /// Release hook of a window resource.
    pub(super) fn window_gone(&mut self, window: WindowId) {
        self.delete_window_from_any_events(window);
        self.directory.delete_window_from_any_save_set(window);
    }

    /// Drop every selection, suppress mask and passive grab on `window`,
    /// deactivate grabs that depend on it and forget contacts and focus.
    pub fn delete_window_from_any_events(&mut self, window: WindowId) {
        if let Some(events) = self.registry.remove_window(window) {
            let resources = events
                .selections
                .iter()
                .filter_map(|s| s.resource)
                .chain(events.passive.iter().filter_map(|g| g.resource));
            for resource in resources {
                self.directory.unbind(resource);
            }
        }
        for device in self.devices.ids() {
            let Some(record) = self.devices.get_mut(device) else {
                continue;
            };
            record.forget_window(window);
            let depends = record
                .grab()
                .is_some_and(|g| g.window == window || g.confine_to == Some(window));
            if depends {
                self.deactivate_grab(device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::resource::Xid;

    fn tree() -> WindowTree {
        let mut tree = WindowTree::new(Xid(1));
        tree.create(Xid(10), Xid(1));
        tree.create(Xid(11), Xid(10));
        tree.create(Xid(12), Xid(10));
        tree.map(Xid(10));
        tree.map(Xid(11));
        tree
    }

    #[test]
    fn ancestry_and_stacking() {
        let tree = tree();
        assert!(tree.ancestor_of(Xid(1), Xid(11)));
        assert!(!tree.ancestor_of(Xid(11), Xid(11)));
        assert_eq!(tree.ordered_children(Xid(10)), vec![Xid(12), Xid(11)]);
    }

    #[test]
    fn viewability_needs_mapped_ancestors() {
        let mut tree = tree();
        assert!(tree.is_viewable(Xid(11)));
        assert!(!tree.is_viewable(Xid(12)));
        tree.unmap(Xid(10));
        assert!(!tree.is_viewable(Xid(11)));
    }

    #[test]
    fn reparent_refuses_cycles() {
        let mut tree = tree();
        assert!(!tree.reparent(Xid(10), Xid(11)));
        assert!(tree.reparent(Xid(11), Xid(1)));
        assert_eq!(tree.parent(Xid(11)), Some(Xid(1)));
        assert_eq!(tree.ordered_children(Xid(10)), vec![Xid(12)]);
    }

    #[test]
    fn destroy_removes_the_subtree() {
        let mut tree = tree();
        assert!(tree.destroy(Xid(10)));
        assert!(!tree.contains(Xid(11)));
        assert_eq!(tree.len(), 1);
        assert!(!tree.destroy(Xid(1)));
    }
}
