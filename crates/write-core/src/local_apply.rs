//! Applying a decoded pool buffer to the storage engine.
//!
//! Both variants re-read the buffer the Repacker built (itself a plain TBF
//! `map { name -> [point, ...] }` document) rather than threading the
//! decoded values through — the buffer is the one shared representation
//! between the local and peer paths.
//!
//! `apply_plain`/`apply_test` are reachable directly from the peer route
//! (a sibling pool's repacked buffer arrives over the network), so a
//! malformed or truncated body must return an error, never panic.

use cluster_core::{Critical, ErrorBus, PoolId, SeriesName, Value};
use wire::{Reader, Token};

use crate::pool_registry::PoolRegistry;
use crate::replica::Replica;
use crate::router::route;
use crate::storage::Engine;

/// A `name + points` fragment sliced verbatim out of a pool buffer, bound
/// for a peer pool that should own the series instead of this node.
#[derive(Debug, Clone)]
pub struct ForwardFragment {
    pub pool: PoolId,
    pub body: Vec<u8>,
}

/// Everything that can go wrong applying a pool buffer: either the storage
/// engine hit a critical failure, or the buffer itself wasn't well-formed
/// TBF (malformed input from a peer, never this node's own Repacker output).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LocalApplyError {
    #[error(transparent)]
    Critical(#[from] Critical),
    #[error("malformed pool buffer: {0}")]
    Malformed(String),
}

/// The plain LocalApply variant: every series in `body` is created (if
/// needed) and its points applied, unconditionally, to this node's storage
/// engine.
pub fn apply_plain(engine: &dyn Engine, error_bus: &ErrorBus, body: &[u8]) -> Result<usize, LocalApplyError> {
    let mut reader = Reader::new(body);
    expect_token(&mut reader, Token::MapOpen, "expected pool buffer to open with a map")?;

    let mut total = 0usize;
    loop {
        if error_bus.raised() {
            break;
        }
        match reader.peek_tag() {
            Some(wire::TAG_MAP_CLOSE) | Some(wire::TAG_END) | None => break,
            _ => {}
        }
        let name = read_entry_name(&mut reader)?;
        total += apply_points_locally(&mut reader, engine, error_bus, &name)?;
    }
    let _ = reader.next_token();
    Ok(total)
}

/// The test variant, used during re-indexing (or when the job carries
/// `TEST`). Series already present locally are applied as in the plain
/// variant; series that are absent are re-routed and either created locally,
/// skipped (because the replica already covers them on a different server),
/// or forwarded verbatim to their rightful pool.
pub fn apply_test(
    engine: &dyn Engine,
    error_bus: &ErrorBus,
    registry: &PoolRegistry,
    own_pool: PoolId,
    replica: Option<&dyn Replica>,
    body: &[u8],
) -> Result<(usize, Vec<ForwardFragment>), LocalApplyError> {
    let mut reader = Reader::new(body);
    expect_token(&mut reader, Token::MapOpen, "expected pool buffer to open with a map")?;

    let mut total = 0usize;
    let mut forwards = Vec::new();
    loop {
        if error_bus.raised() {
            break;
        }
        match reader.peek_tag() {
            Some(wire::TAG_MAP_CLOSE) | Some(wire::TAG_END) | None => break,
            _ => {}
        }
        let entry_start = reader.position();
        let name = read_entry_name(&mut reader)?;

        if engine.contains(&name) {
            total += apply_points_locally(&mut reader, engine, error_bus, &name)?;
            continue;
        }

        let pool = route(&name, own_pool, registry, engine);
        if pool == own_pool {
            total += apply_points_locally(&mut reader, engine, error_bus, &name)?;
            continue;
        }

        let replica_covers_elsewhere = replica
            .map(|r| r.server_id(&name) != r.own_server_id())
            .unwrap_or(false);
        skip_points_array(&mut reader)?;
        if replica_covers_elsewhere {
            // The replica already forwards this series; nothing more to do.
            continue;
        }
        let entry_end = reader.position();
        forwards.push(ForwardFragment {
            pool,
            body: body[entry_start..entry_end].to_vec(),
        });
    }
    let _ = reader.next_token();
    Ok((total, forwards))
}

/// Reads the next token and checks it matches `expected`, folding both the
/// "stream ended early" and "wrong token" cases into one [`LocalApplyError`].
fn expect_token(reader: &mut Reader<'_>, expected: Token<'_>, msg: &str) -> Result<(), LocalApplyError> {
    match reader.next_token() {
        Ok(tok) if tok == expected => Ok(()),
        _ => Err(LocalApplyError::Malformed(msg.to_string())),
    }
}

fn read_entry_name(reader: &mut Reader<'_>) -> Result<SeriesName, LocalApplyError> {
    let tok = reader
        .next_token()
        .map_err(|_| LocalApplyError::Malformed("expected a series name".to_string()))?;
    let bytes = match tok {
        Token::Raw(b) => b,
        _ => return Err(LocalApplyError::Malformed("expected a series name".to_string())),
    };
    SeriesName::new(bytes.to_vec()).map_err(|e| LocalApplyError::Malformed(e.to_string()))
}

/// Applies one series' points under the engine's combined lock, creating the
/// series from the first point's value type if it doesn't already exist.
/// Scoped to a single series (rather than the whole buffer) so the test
/// variant's `engine.contains`/route checks between entries never try to
/// re-acquire `series_mutex` while this lock is already held.
fn apply_points_locally(
    reader: &mut Reader<'_>,
    engine: &dyn Engine,
    error_bus: &ErrorBus,
    name: &SeriesName,
) -> Result<usize, LocalApplyError> {
    expect_token(reader, Token::ArrayOpen, "expected series entry to open with an array")?;

    let mut guard = engine.lock();
    let mut handle = None;
    let mut count = 0usize;
    loop {
        if error_bus.raised() {
            break;
        }
        match reader.peek_tag() {
            Some(wire::TAG_ARRAY_CLOSE) => {
                let _ = reader.next_token();
                break;
            }
            None => break,
            _ => {}
        }
        let (ts, value) = read_point(reader)?;
        let h = match handle {
            Some(h) => h,
            None => {
                let h = guard.get_or_create(name, &value).inspect_err(|_| error_bus.raise())?;
                handle = Some(h);
                h
            }
        };
        guard.add_point(&h, ts, &value).inspect_err(|_| error_bus.raise())?;
        count += 1;
    }
    Ok(count)
}

fn read_point(reader: &mut Reader<'_>) -> Result<(i64, Value), LocalApplyError> {
    let marker = reader
        .next_token()
        .map_err(|_| LocalApplyError::Malformed("expected point to start with the 2-element marker".to_string()))?;
    if marker != Token::Array2 {
        return Err(LocalApplyError::Malformed(
            "expected point to start with the 2-element marker".to_string(),
        ));
    }
    let ts_tok = reader
        .next_token()
        .map_err(|_| LocalApplyError::Malformed("expected point to carry an integer timestamp".to_string()))?;
    let ts = match ts_tok {
        Token::Int(v) => v,
        _ => {
            return Err(LocalApplyError::Malformed(
                "expected point to carry an integer timestamp".to_string(),
            ))
        }
    };
    let value_tok = reader
        .next_token()
        .map_err(|_| LocalApplyError::Malformed("expected point to carry a value".to_string()))?;
    let value = match value_tok {
        Token::Int(v) => Value::Integer(v),
        Token::Float(v) => Value::Float(v),
        Token::Raw(b) => Value::String(b.to_vec()),
        _ => return Err(LocalApplyError::Malformed("expected point to carry a value".to_string())),
    };
    Ok((ts, value))
}

/// Structurally skips a `[ (ARRAY2 ts value) ... ]` points array without
/// materializing any value, so a forwarded fragment's byte range can be
/// sliced out verbatim.
fn skip_points_array(reader: &mut Reader<'_>) -> Result<(), LocalApplyError> {
    expect_token(reader, Token::ArrayOpen, "expected series entry to open with an array")?;
    loop {
        match reader.peek_tag() {
            Some(wire::TAG_ARRAY_CLOSE) => {
                let _ = reader.next_token();
                break;
            }
            None => break,
            _ => {}
        }
        for _ in 0..3 {
            reader
                .next_token()
                .map_err(|_| LocalApplyError::Malformed("expected a point triple".to_string()))?;
        }
    }
    Ok(())
}

/// Builds a standalone `map { name -> points } end` document, the same
/// shape a pool buffer has, for use as a transport/local-apply test
/// fixture.
#[cfg(test)]
pub(crate) fn encode_one_series_for_test(name: &SeriesName, points: &[(i64, Value)]) -> Vec<u8> {
    let mut buf = crate::repacker::PoolBuffer::new();
    buf.push_series(name.as_bytes(), points);
    buf.finish()
}
