use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use scopesync::{
    ConnectionHandle, ConnectionRegistry, MirrorConfig, Scope, ShapeDescriptor,
    connection::MemoryBridge,
    mirror::IdentityGenerator,
    model::{Entity, Identity, Node},
};

pub const SHAPE: &str = "Person";

/// Hands out `{graph}/n{counter}` subjects so tests can predict paths.
#[derive(Default)]
pub struct Sequential(AtomicUsize);

impl IdentityGenerator for Sequential {
    fn subject(&self, graph: &str, _parent: Option<&Identity>) -> String {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        format!("{graph}/n{n}")
    }
}

pub fn person(graph: &str, subject: &str, name: &str) -> Entity {
    Entity::identified(&Identity::new(graph, subject)).with("name", name)
}

/// A fresh tree rooted at an empty entity.
pub fn entity_root() -> Node {
    Node::Entity(Entity::new())
}

pub fn text_at(root: &Node, path: &[&str]) -> Option<String> {
    root.lookup(path)
        .and_then(Node::as_text)
        .map(str::to_string)
}

/// A registry with `bridge` attached as session 1.
pub fn attached_registry(bridge: &Arc<MemoryBridge>, config: MirrorConfig) -> ConnectionRegistry {
    let registry = ConnectionRegistry::new(config);
    registry.attach(bridge.clone(), 1);
    registry
}

pub fn acquire_people(registry: &ConnectionRegistry, graphs: &[&str]) -> ConnectionHandle {
    registry
        .acquire(
            ShapeDescriptor::new(SHAPE),
            Scope::graphs(graphs.iter().copied()),
        )
        .expect("acquire inside a runtime")
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
