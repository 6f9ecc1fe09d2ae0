//! Handler registry and frame dispatch.
//!
//! Schemas are registered once at startup, each incoming schema with the
//! handler that consumes it and, optionally, the phases it is accepted in.
//! The built [`Registry`] is immutable and shared by every session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::hooks::FrameInfo;
use crate::packet::{codec, CodecError, PacketSchema, Record};
use crate::session::{self, Phase, Phases, Session, SessionError, HANDSHAKE_HEADER, PHASE_HEADER};

/// Consumes one decoded frame.
///
/// Errors are logged against the session and the connection stays open.
#[async_trait]
pub trait Handler<P: Phases>: Send + Sync + 'static {
    async fn handle(&self, session: &mut Session<P>, record: Record) -> anyhow::Result<()>;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(F);

#[async_trait]
impl<P, F> Handler<P> for FnHandler<F>
where
    P: Phases,
    F: Fn(&mut Session<P>, Record) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, session: &mut Session<P>, record: Record) -> anyhow::Result<()> {
        (self.0)(session, record)
    }
}

pub fn handler_fn<P, F>(f: F) -> Arc<dyn Handler<P>>
where
    P: Phases,
    F: Fn(&mut Session<P>, Record) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// An incoming schema bound to its handler.
pub struct Registration<P: Phases> {
    pub schema: Arc<PacketSchema>,
    handler: Arc<dyn Handler<P>>,
    phases: Option<Vec<P>>,
}

impl<P: Phases> Registration<P> {
    /// Whether a frame of this kind may be handled in `phase`.
    pub fn allows(&self, phase: Phase<P>) -> bool {
        match (phase.active(), &self.phases) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(p), Some(allowed)) => allowed.contains(&p),
        }
    }
}

type Key = (u8, Option<u8>);

pub struct RegistryBuilder<P: Phases> {
    incoming: Vec<Registration<P>>,
    outgoing: Vec<Arc<PacketSchema>>,
}

impl<P: Phases> Default for RegistryBuilder<P> {
    fn default() -> Self {
        Self {
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }
}

impl<P: Phases> RegistryBuilder<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `schema` in every application phase.
    pub fn register(mut self, schema: Arc<PacketSchema>, handler: Arc<dyn Handler<P>>) -> Self {
        self.incoming.push(Registration {
            schema,
            handler,
            phases: None,
        });
        self
    }

    /// Handle `schema` only in the listed phases. Anywhere else the frame is
    /// consumed and dropped.
    pub fn register_in(mut self, schema: Arc<PacketSchema>, handler: Arc<dyn Handler<P>>, phases: &[P]) -> Self {
        self.incoming.push(Registration {
            schema,
            handler,
            phases: Some(phases.to_vec()),
        });
        self
    }

    /// Make an outgoing schema available by name.
    pub fn declare(mut self, schema: Arc<PacketSchema>) -> Self {
        self.outgoing.push(schema);
        self
    }

    /// Check the whole table and freeze it.
    pub fn build(self) -> Result<Registry<P>, CodecError> {
        let handshake = session::handshake::handshake_schema()?;
        let phase = session::handshake::phase_schema()?;

        let mut incoming: HashMap<Key, Registration<P>> = HashMap::new();
        let mut sub_headers: HashMap<u8, bool> = HashMap::new();
        let mut outgoing: HashMap<&'static str, Arc<PacketSchema>> = HashMap::new();
        let mut outgoing_keys: HashMap<Key, &'static str> = HashMap::new();

        for reg in self.incoming {
            let schema = &reg.schema;
            check_reserved(schema)?;
            if !schema.direction().is_incoming() {
                return Err(CodecError::mismatch(schema.name(), "handler registered for an outgoing-only schema"));
            }

            let uses_sub = schema.sub_header().is_some();
            match sub_headers.get(&schema.header()) {
                Some(&prev) if prev != uses_sub => {
                    return Err(CodecError::mismatch(
                        schema.name(),
                        format!("header {:#04X} mixes schemas with and without a sub-header", schema.header()),
                    ));
                }
                _ => {
                    sub_headers.insert(schema.header(), uses_sub);
                }
            }

            let key = (schema.header(), schema.sub_header());
            if let Some(prev) = incoming.get(&key) {
                return Err(CodecError::mismatch(
                    schema.name(),
                    format!("incoming key already taken by '{}'", prev.schema.name()),
                ));
            }
            if schema.direction().is_outgoing() {
                insert_outgoing(&mut outgoing, &mut outgoing_keys, schema.clone())?;
            }
            incoming.insert(key, reg);
        }

        for schema in self.outgoing {
            check_reserved(&schema)?;
            if !schema.direction().is_outgoing() {
                return Err(CodecError::mismatch(schema.name(), "declared schema is incoming-only"));
            }
            insert_outgoing(&mut outgoing, &mut outgoing_keys, schema)?;
        }

        tracing::debug!(
            "[dispatch] registry built: incoming={} outgoing={}",
            incoming.len(),
            outgoing.len()
        );

        Ok(Registry {
            incoming,
            sub_headers,
            outgoing,
            handshake,
            phase,
        })
    }
}

fn check_reserved(schema: &PacketSchema) -> Result<(), CodecError> {
    if matches!(schema.header(), HANDSHAKE_HEADER | PHASE_HEADER) {
        return Err(CodecError::mismatch(
            schema.name(),
            format!("header {:#04X} is reserved for the session core", schema.header()),
        ));
    }
    Ok(())
}

fn insert_outgoing(
    by_name: &mut HashMap<&'static str, Arc<PacketSchema>>,
    by_key: &mut HashMap<Key, &'static str>,
    schema: Arc<PacketSchema>,
) -> Result<(), CodecError> {
    let key = (schema.header(), schema.sub_header());
    if let Some(prev) = by_key.get(&key) {
        return Err(CodecError::mismatch(schema.name(), format!("outgoing key already taken by '{prev}'")));
    }
    if by_name.contains_key(schema.name()) {
        return Err(CodecError::mismatch(schema.name(), "duplicate outgoing schema name"));
    }
    by_key.insert(key, schema.name());
    by_name.insert(schema.name(), schema);
    Ok(())
}

/// Immutable lookup table from header (and sub-header) to registration.
pub struct Registry<P: Phases> {
    incoming: HashMap<Key, Registration<P>>,
    sub_headers: HashMap<u8, bool>,
    outgoing: HashMap<&'static str, Arc<PacketSchema>>,
    handshake: Arc<PacketSchema>,
    phase: Arc<PacketSchema>,
}

impl<P: Phases> Registry<P> {
    pub fn resolve(&self, header: u8, sub_header: Option<u8>) -> Option<&Registration<P>> {
        self.incoming.get(&(header, sub_header))
    }

    /// `None` for unknown headers, otherwise whether a sub-header byte follows.
    pub fn uses_sub_header(&self, header: u8) -> Option<bool> {
        self.sub_headers.get(&header).copied()
    }

    /// Outgoing schema by name.
    pub fn outgoing(&self, name: &str) -> Option<&Arc<PacketSchema>> {
        self.outgoing.get(name)
    }

    pub fn handshake_schema(&self) -> &Arc<PacketSchema> {
        &self.handshake
    }

    pub fn phase_schema(&self) -> &Arc<PacketSchema> {
        &self.phase
    }

    /// Decode one complete frame and run its handler.
    ///
    /// Framing, decoding and sequence faults are returned and close the
    /// session. A frame outside its allowed phases is dropped, and a handler
    /// failure is logged; neither is returned.
    pub async fn dispatch(&self, session: &mut Session<P>, frame: Bytes) -> Result<(), SessionError> {
        let Some(&header) = frame.first() else {
            return Err(CodecError::TruncatedFrame { header: 0, need: 1, got: 0 }.into());
        };
        let sub_header = match self.uses_sub_header(header) {
            Some(true) => frame.get(1).copied(),
            Some(false) => None,
            None => return Err(SessionError::UnknownPacket { header, sub_header: None }),
        };
        let reg = self
            .resolve(header, sub_header)
            .ok_or(SessionError::UnknownPacket { header, sub_header })?;

        let info = FrameInfo {
            session: session.id(),
            header,
            sub_header,
            len: frame.len(),
        };
        session.hooks().before_decode(&info);
        let decoded = codec::decode(&reg.schema, &frame)?;
        session.check_sequence(decoded.sequence)?;
        session.hooks().after_decode(&info, &decoded.record);

        if !reg.allows(session.phase()) {
            tracing::warn!(
                "[dispatch] id={} dropped {} in phase {}",
                session.id(),
                reg.schema.name(),
                session.phase()
            );
            return Ok(());
        }

        if let Err(e) = reg.handler.handle(session, decoded.record).await {
            let err = SessionError::Handler(e);
            tracing::warn!("[dispatch] id={} {} failed: {:#}", session.id(), reg.schema.name(), err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FieldSpec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        One,
        Two,
    }

    impl Phases for Step {
        fn entry() -> Self {
            Step::One
        }

        fn can_advance_to(self, next: Self) -> bool {
            self == Step::One && next == Step::Two
        }

        fn code(self) -> u8 {
            self as u8
        }
    }

    fn noop() -> Arc<dyn Handler<Step>> {
        handler_fn(|_s: &mut Session<Step>, _r: Record| Ok(()))
    }

    fn schema(name: &'static str, header: u8) -> crate::packet::SchemaBuilder {
        PacketSchema::builder(name, header)
    }

    #[test]
    fn test_resolve_by_header_and_sub_header() {
        let registry = RegistryBuilder::new()
            .register(schema("buy", 0x27).incoming().sub_header(1).build().unwrap(), noop())
            .register(schema("sell", 0x27).incoming().sub_header(2).build().unwrap(), noop())
            .register(schema("ping", 0x10).incoming().build().unwrap(), noop())
            .build()
            .unwrap();

        assert_eq!(registry.resolve(0x27, Some(2)).unwrap().schema.name(), "sell");
        assert_eq!(registry.resolve(0x10, None).unwrap().schema.name(), "ping");
        assert!(registry.resolve(0x27, Some(3)).is_none());
        assert_eq!(registry.uses_sub_header(0x27), Some(true));
        assert_eq!(registry.uses_sub_header(0x10), Some(false));
        assert_eq!(registry.uses_sub_header(0x11), None);
    }

    #[test]
    fn test_duplicate_incoming_rejected() {
        let result = RegistryBuilder::new()
            .register(schema("a", 0x10).incoming().build().unwrap(), noop())
            .register(schema("b", 0x10).incoming().build().unwrap(), noop())
            .build();
        assert!(matches!(result, Err(CodecError::SchemaMismatch { schema: "b", .. })));
    }

    #[test]
    fn test_same_header_each_direction_is_fine() {
        let registry = RegistryBuilder::new()
            .register(schema("ping", 0x10).incoming().build().unwrap(), noop())
            .declare(schema("pong", 0x10).outgoing().field(FieldSpec::u32("t")).build().unwrap())
            .build()
            .unwrap();
        assert!(registry.outgoing("pong").is_some());
        assert!(registry.outgoing("ping").is_none());
    }

    #[test]
    fn test_reserved_headers_rejected() {
        let result = RegistryBuilder::<Step>::new()
            .declare(schema("fake", HANDSHAKE_HEADER).outgoing().build().unwrap())
            .build();
        assert!(result.is_err());
        let result = RegistryBuilder::new()
            .register(schema("fake", PHASE_HEADER).incoming().build().unwrap(), noop())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_mixed_sub_header_use_rejected() {
        let result = RegistryBuilder::new()
            .register(schema("a", 0x27).incoming().sub_header(1).build().unwrap(), noop())
            .register(schema("b", 0x27).incoming().build().unwrap(), noop())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_handler_on_outgoing_schema_rejected() {
        let result = RegistryBuilder::new()
            .register(schema("out", 0x02).outgoing().build().unwrap(), noop())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_phase_allowance() {
        let registry = RegistryBuilder::new()
            .register_in(schema("late", 0x05).incoming().build().unwrap(), noop(), &[Step::Two])
            .register(schema("any", 0x06).incoming().build().unwrap(), noop())
            .build()
            .unwrap();
        let late = registry.resolve(0x05, None).unwrap();
        let any = registry.resolve(0x06, None).unwrap();

        assert!(!late.allows(Phase::Active(Step::One)));
        assert!(late.allows(Phase::Active(Step::Two)));
        assert!(any.allows(Phase::Active(Step::One)));
        assert!(!any.allows(Phase::Handshake));
        assert!(!any.allows(Phase::Closed));
    }
}
