//! Chunk handler registry

use super::handlers::{
    HeapHandler, HelloHandler, NativeHeapHandler, ProfilingHandler, ViewDebugHandler,
};
use super::packet::Chunk;
use super::types::ChunkType;
use crate::client::ClientSession;
use crate::core::listener::Listeners;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Decodes and applies the chunk types it owns
pub trait ChunkHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tags routed to this handler
    fn chunk_types(&self) -> &'static [ChunkType];

    /// Session registered with the dispatch loop
    fn client_ready(&self, _client: &ClientSession) -> Result<()> {
        Ok(())
    }

    fn client_disconnected(&self, _client: &ClientSession) {}

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        is_reply: bool,
        msg_id: u32,
    ) -> Result<()>;
}

/// Maps chunk tags to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    by_type: HashMap<ChunkType, Arc<dyn ChunkHandler>>,
    handlers: Vec<Arc<dyn ChunkHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler
    pub fn with_default_handlers(listeners: &Listeners) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HelloHandler::new(listeners.clone())));
        registry.register(Arc::new(HeapHandler::new(listeners.clone())));
        registry.register(Arc::new(ProfilingHandler::new(listeners.clone())));
        registry.register(Arc::new(NativeHeapHandler::new(listeners.clone())));
        registry.register(Arc::new(ViewDebugHandler));
        registry
    }

    /// Register a handler for all of its tags, replacing earlier owners
    pub fn register(&mut self, handler: Arc<dyn ChunkHandler>) {
        for &kind in handler.chunk_types() {
            if let Some(previous) = self.by_type.insert(kind, Arc::clone(&handler)) {
                log::debug!("{} now handled by {} (was {})", kind, handler.name(), previous.name());
            }
        }
        self.handlers.push(handler);
    }

    pub fn get(&self, kind: ChunkType) -> Option<Arc<dyn ChunkHandler>> {
        self.by_type.get(&kind).cloned()
    }

    pub fn handlers(&self) -> &[Arc<dyn ChunkHandler>] {
        &self.handlers
    }

    /// Route an inbound chunk to `owner` or to the handler of its tag
    pub fn dispatch(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        is_reply: bool,
        msg_id: u32,
        owner: Option<Arc<dyn ChunkHandler>>,
    ) -> Result<()> {
        let handler = owner
            .or_else(|| self.get(chunk.kind))
            .ok_or_else(|| Error::UnknownChunk(chunk.kind.name()))?;
        log::trace!("{}: {} -> {}", client.key(), chunk.kind, handler.name());
        handler.handle_chunk(client, chunk, is_reply, msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClientKey;
    use parking_lot::Mutex;

    const TEST: ChunkType = ChunkType::from_tag(b"TEST");
    const OTHR: ChunkType = ChunkType::from_tag(b"OTHR");

    struct Recorder {
        seen: Mutex<Vec<(ChunkType, bool, u32)>>,
    }

    impl ChunkHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn chunk_types(&self) -> &'static [ChunkType] {
            &[TEST]
        }

        fn handle_chunk(
            &self,
            _client: &ClientSession,
            chunk: &Chunk,
            is_reply: bool,
            msg_id: u32,
        ) -> Result<()> {
            self.seen.lock().push((chunk.kind, is_reply, msg_id));
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_by_tag() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut registry = HandlerRegistry::new();
        registry.register(recorder.clone());

        let client = ClientSession::detached(ClientKey::new("a", 1));
        registry
            .dispatch(&client, &Chunk::empty(TEST), false, 3, None)
            .unwrap();
        assert_eq!(recorder.seen.lock().as_slice(), &[(TEST, false, 3)]);
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let registry = HandlerRegistry::new();
        let client = ClientSession::detached(ClientKey::new("a", 1));
        assert!(matches!(
            registry.dispatch(&client, &Chunk::empty(OTHR), false, 1, None),
            Err(Error::UnknownChunk(name)) if name == "OTHR"
        ));
    }

    #[test]
    fn test_owner_overrides_tag() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let registry = HandlerRegistry::new();
        let client = ClientSession::detached(ClientKey::new("a", 1));

        // Reply with a tag nobody registered still reaches the request owner
        registry
            .dispatch(&client, &Chunk::empty(OTHR), true, 9, Some(recorder.clone()))
            .unwrap();
        assert_eq!(recorder.seen.lock().as_slice(), &[(OTHR, true, 9)]);
    }

    #[test]
    fn test_default_handlers_cover_tags() {
        let registry = HandlerRegistry::with_default_handlers(&Listeners::default());
        for tag in [
            b"HELO", b"FEAT", b"APNM", b"WAIT", b"HPIF", b"HPST", b"HPEN", b"HPSG", b"HPDS",
            b"HPDU", b"REAQ", b"REAL", b"MPRE", b"MPSE", b"MPRQ", b"FAIL", b"NHGT", b"NHSG",
            b"NHST", b"NHEN", b"VULW", b"VURT", b"VUOP",
        ] {
            assert!(
                registry.get(ChunkType::from_tag(tag)).is_some(),
                "no handler for {}",
                String::from_utf8_lossy(tag)
            );
        }
    }
}
