//! Streaming TBF parse of an insert request into one [`PoolBuffer`] per
//! pool.
//!
//! The top level is either a map (`series_name -> points`) or an array of
//! `{name, points}` records; both forms must yield the same per-pool
//! buffers. Points are pushed into the target pool's buffer one at a time
//! as they're read — the only case that buffers ahead is the array form
//! with `points` listed before `name`, where the destination pool isn't
//! known yet.

use cluster_core::{DecodeError, ErrorBus, PoolId, SeriesName, TimePrecision, Value};
use wire::{Reader, Token};

use crate::pool_registry::PoolRegistry;
use crate::repacker::{write_value, PoolBuffer};
use crate::router::route;
use crate::storage::Engine;

/// Everything [`assign`] needs to route a series and validate a point's
/// timestamp, gathered so the call site doesn't thread five separate
/// arguments through.
pub struct DecodeContext<'a> {
    pub own_pool: PoolId,
    pub registry: &'a PoolRegistry,
    pub engine: &'a dyn Engine,
    pub precision: &'a TimePrecision,
    /// The same bus the job's LocalApply pass will check; shared so a
    /// critical failure on one pass aborts the other half of the same job.
    pub error_bus: &'a ErrorBus,
}

/// Parses `bytes` and appends every series into `buffers[pool.0]`, where
/// `buffers` has one slot per pool, sized at job creation and never resized
/// afterward. Returns the total point count across all pools on success.
pub fn assign(bytes: &[u8], ctx: &DecodeContext, buffers: &mut [PoolBuffer]) -> Result<usize, DecodeError> {
    if ctx.error_bus.raised() {
        return Err(DecodeError::BusAlreadyTripped);
    }
    let mut reader = Reader::new(bytes);
    match reader.peek_tag() {
        Some(wire::TAG_MAP_OPEN) => {
            next(&mut reader, DecodeError::ExpectingMapOrArray)?;
            assign_map(&mut reader, ctx, buffers)
        }
        Some(wire::TAG_ARRAY_OPEN) => {
            next(&mut reader, DecodeError::ExpectingMapOrArray)?;
            assign_array(&mut reader, ctx, buffers)
        }
        _ => Err(DecodeError::ExpectingMapOrArray),
    }
}

fn next<'a>(reader: &mut Reader<'a>, on_err: DecodeError) -> Result<Token<'a>, DecodeError> {
    reader.next_token().map_err(|_| on_err)
}

fn target<'b>(buffers: &'b mut [PoolBuffer], pool: PoolId) -> &'b mut PoolBuffer {
    &mut buffers[pool.0 as usize]
}

fn assign_map(reader: &mut Reader<'_>, ctx: &DecodeContext, buffers: &mut [PoolBuffer]) -> Result<usize, DecodeError> {
    let mut total = 0usize;
    loop {
        match reader.peek_tag() {
            Some(wire::TAG_MAP_CLOSE) | Some(wire::TAG_END) | None => break,
            _ => {}
        }
        let name = read_series_name(reader)?;
        let pool = route(&name, ctx.own_pool, ctx.registry, ctx.engine);
        let count = decode_points_streaming(reader, ctx, target(buffers, pool), name.as_bytes())?;
        total += count;
    }
    // Consume MAP_CLOSE/END if present; trailing bytes beyond it are never
    // consulted.
    let _ = reader.next_token();
    Ok(total)
}

fn read_series_name(reader: &mut Reader<'_>) -> Result<SeriesName, DecodeError> {
    let tok = next(reader, DecodeError::ExpectingSeriesName)?;
    let bytes = match tok {
        Token::Raw(b) => b,
        _ => return Err(DecodeError::ExpectingSeriesName),
    };
    SeriesName::new(bytes.to_vec()).map_err(|_| DecodeError::ExpectingSeriesName)
}

/// Consumes `ARRAY_OPEN (ARRAY2 ts value)+ ARRAY_CLOSE` and streams each
/// validated point directly into `buffer` as it's read.
fn decode_points_streaming(
    reader: &mut Reader<'_>,
    ctx: &DecodeContext,
    buffer: &mut PoolBuffer,
    name: &[u8],
) -> Result<usize, DecodeError> {
    let open = next(reader, DecodeError::ExpectingArray)?;
    if open != Token::ArrayOpen {
        return Err(DecodeError::ExpectingArray);
    }
    buffer.start_series(name);
    let mut count = 0usize;
    loop {
        match reader.peek_tag() {
            Some(wire::TAG_ARRAY_CLOSE) => {
                let _ = reader.next_token();
                break;
            }
            None => return Err(DecodeError::ExpectingArray),
            _ => {}
        }
        let (ts, value) = decode_one_point(reader, ctx)?;
        buffer.push_point(ts, &value);
        count += 1;
    }
    if count == 0 {
        return Err(DecodeError::ExpectingAtLeastOnePoint);
    }
    buffer.end_series();
    Ok(count)
}

/// Same shape as [`decode_points_streaming`] but collects the point triples
/// into a standalone byte fragment instead of a [`PoolBuffer`] — used by the
/// array form when `points` precedes `name` and the destination pool is not
/// yet known.
fn decode_points_into_scratch(reader: &mut Reader<'_>, ctx: &DecodeContext) -> Result<(Vec<u8>, usize), DecodeError> {
    let open = next(reader, DecodeError::ExpectingArray)?;
    if open != Token::ArrayOpen {
        return Err(DecodeError::ExpectingArray);
    }
    let mut scratch = wire::Writer::new();
    let mut count = 0usize;
    loop {
        match reader.peek_tag() {
            Some(wire::TAG_ARRAY_CLOSE) => {
                let _ = reader.next_token();
                break;
            }
            None => return Err(DecodeError::ExpectingArray),
            _ => {}
        }
        let (ts, value) = decode_one_point(reader, ctx)?;
        scratch.array2();
        scratch.int(ts);
        write_value(&mut scratch, &value);
        count += 1;
    }
    if count == 0 {
        return Err(DecodeError::ExpectingAtLeastOnePoint);
    }
    Ok((scratch.into_bytes(), count))
}

fn decode_one_point(reader: &mut Reader<'_>, ctx: &DecodeContext) -> Result<(i64, Value), DecodeError> {
    let element = next(reader, DecodeError::ExpectingArray)?;
    if element != Token::Array2 {
        // Rule: each element must be a 2-tuple. No dedicated wire code
        // exists for this in the taxonomy; reuse EXPECTING_ARRAY since a
        // malformed element means the points container isn't a valid
        // array-of-pairs.
        return Err(DecodeError::ExpectingArray);
    }
    let ts_tok = next(reader, DecodeError::ExpectingIntegerTs)?;
    let ts = match ts_tok {
        Token::Int(v) => v,
        _ => return Err(DecodeError::ExpectingIntegerTs),
    };
    if !ctx.precision.contains(ts) {
        return Err(DecodeError::TimestampOutOfRange);
    }
    let value_tok = next(reader, DecodeError::UnsupportedValue)?;
    let value = match value_tok {
        Token::Int(v) => Value::Integer(v),
        Token::Float(v) => Value::Float(v),
        Token::Raw(b) => Value::String(b.to_vec()),
        _ => return Err(DecodeError::UnsupportedValue),
    };
    Ok((ts, value))
}

fn assign_array(reader: &mut Reader<'_>, ctx: &DecodeContext, buffers: &mut [PoolBuffer]) -> Result<usize, DecodeError> {
    let mut total = 0usize;
    loop {
        match reader.peek_tag() {
            Some(wire::TAG_ARRAY_CLOSE) | Some(wire::TAG_END) | None => break,
            _ => {}
        }
        total += assign_array_element(reader, ctx, buffers)?;
    }
    let _ = reader.next_token();
    Ok(total)
}

fn assign_array_element(
    reader: &mut Reader<'_>,
    ctx: &DecodeContext,
    buffers: &mut [PoolBuffer],
) -> Result<usize, DecodeError> {
    let open = next(reader, DecodeError::ExpectingNameAndPoints)?;
    if open != Token::MapOpen {
        return Err(DecodeError::ExpectingNameAndPoints);
    }

    let first_key = expect_key(reader)?;
    let count = match first_key.as_slice() {
        b"name" => {
            let name = read_series_name(reader)?;
            expect_exact_key(reader, b"points")?;
            let pool = route(&name, ctx.own_pool, ctx.registry, ctx.engine);
            decode_points_streaming(reader, ctx, target(buffers, pool), name.as_bytes())?
        }
        b"points" => {
            let (scratch, count) = decode_points_into_scratch(reader, ctx)?;
            expect_exact_key(reader, b"name")?;
            let name = read_series_name(reader)?;
            let pool = route(&name, ctx.own_pool, ctx.registry, ctx.engine);
            let buffer = target(buffers, pool);
            buffer.start_series(name.as_bytes());
            buffer.extend_raw(&scratch);
            buffer.end_series();
            count
        }
        _ => return Err(DecodeError::ExpectingNameAndPoints),
    };

    let close = next(reader, DecodeError::ExpectingNameAndPoints)?;
    if close != Token::MapClose {
        return Err(DecodeError::ExpectingNameAndPoints);
    }
    Ok(count)
}

fn expect_key(reader: &mut Reader<'_>) -> Result<Vec<u8>, DecodeError> {
    let tok = next(reader, DecodeError::ExpectingNameAndPoints)?;
    match tok {
        Token::Raw(b) => Ok(b.to_vec()),
        _ => Err(DecodeError::ExpectingNameAndPoints),
    }
}

fn expect_exact_key(reader: &mut Reader<'_>, expected: &[u8]) -> Result<(), DecodeError> {
    let got = expect_key(reader)?;
    if got == expected {
        Ok(())
    } else {
        Err(DecodeError::ExpectingNameAndPoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_registry::{fnv1a_lookup, PoolRegistry};
    use crate::storage::MemEngine;
    use cluster_core::ErrorBus;
    use wire::Writer;

    fn ctx<'a>(
        registry: &'a PoolRegistry,
        engine: &'a MemEngine,
        precision: &'a TimePrecision,
        error_bus: &'a ErrorBus,
    ) -> DecodeContext<'a> {
        DecodeContext {
            own_pool: PoolId(0),
            registry,
            engine,
            precision,
            error_bus,
        }
    }

    fn one_buffer() -> Vec<PoolBuffer> {
        vec![PoolBuffer::new()]
    }

    #[test]
    fn map_form_decodes_single_series() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();
        let mut w = Writer::new();
        w.map_open()
            .raw(b"cpu")
            .array_open()
            .array2()
            .int(100)
            .int(1)
            .array2()
            .int(200)
            .int(2)
            .array_close()
            .map_close()
            .end();
        let bytes = w.into_bytes();
        let mut buffers = one_buffer();
        let n = assign(&bytes, &ctx(&registry, &engine, &precision, &bus), &mut buffers).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buffers[0].entry_count(), 1);
    }

    #[test]
    fn array_form_with_name_first_matches_map_form() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();

        let mut map_w = Writer::new();
        map_w
            .map_open()
            .raw(b"a")
            .array_open()
            .array2()
            .int(1)
            .int(1)
            .array_close()
            .map_close()
            .end();
        let mut map_buffers = one_buffer();
        assign(&map_w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut map_buffers).unwrap();

        let mut arr_w = Writer::new();
        arr_w
            .array_open()
            .map_open()
            .raw(b"name")
            .raw(b"a")
            .raw(b"points")
            .array_open()
            .array2()
            .int(1)
            .int(1)
            .array_close()
            .map_close()
            .array_close()
            .end();
        let mut arr_buffers = one_buffer();
        assign(&arr_w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut arr_buffers).unwrap();

        assert_eq!(
            map_buffers.remove(0).finish(),
            arr_buffers.remove(0).finish()
        );
    }

    #[test]
    fn array_form_with_points_first_matches_name_first() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();

        let mut name_first = Writer::new();
        name_first
            .array_open()
            .map_open()
            .raw(b"name")
            .raw(b"a")
            .raw(b"points")
            .array_open()
            .array2()
            .int(1)
            .int(1)
            .array_close()
            .map_close()
            .array_close()
            .end();
        let mut buf_a = one_buffer();
        assign(&name_first.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buf_a).unwrap();

        let mut points_first = Writer::new();
        points_first
            .array_open()
            .map_open()
            .raw(b"points")
            .array_open()
            .array2()
            .int(1)
            .int(1)
            .array_close()
            .raw(b"name")
            .raw(b"a")
            .map_close()
            .array_close()
            .end();
        let mut buf_b = one_buffer();
        assign(&points_first.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buf_b).unwrap();

        assert_eq!(buf_a.remove(0).finish(), buf_b.remove(0).finish());
    }

    #[test]
    fn non_integer_timestamp_is_rejected() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();
        let mut w = Writer::new();
        w.map_open()
            .raw(b"a")
            .array_open()
            .array2()
            .raw(b"not-an-int")
            .int(1)
            .array_close()
            .map_close()
            .end();
        let mut buffers = one_buffer();
        let err = assign(&w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buffers).unwrap_err();
        assert_eq!(err, DecodeError::ExpectingIntegerTs);
    }

    #[test]
    fn empty_points_array_is_rejected() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();
        let mut w = Writer::new();
        w.map_open().raw(b"a").array_open().array_close().map_close().end();
        let mut buffers = one_buffer();
        let err = assign(&w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buffers).unwrap_err();
        assert_eq!(err, DecodeError::ExpectingAtLeastOnePoint);
    }

    #[test]
    fn empty_batch_yields_zero_points_and_an_empty_buffer() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();
        let mut w = Writer::new();
        w.map_open().map_close().end();
        let mut buffers = one_buffer();
        let n = assign(&w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buffers).unwrap();
        assert_eq!(n, 0);
        assert!(buffers[0].is_empty());
    }

    #[test]
    fn timestamp_out_of_range_is_rejected() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::new(cluster_core::TimeUnit::Seconds, 0, 100);
        let bus = ErrorBus::new();
        let mut w = Writer::new();
        w.map_open()
            .raw(b"a")
            .array_open()
            .array2()
            .int(1_000)
            .int(1)
            .array_close()
            .map_close()
            .end();
        let mut buffers = one_buffer();
        let err = assign(&w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buffers).unwrap_err();
        assert_eq!(err, DecodeError::TimestampOutOfRange);
    }

    #[test]
    fn already_tripped_bus_short_circuits_before_any_decode_work() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        let engine = MemEngine::new();
        let precision = TimePrecision::unbounded_seconds();
        let bus = ErrorBus::new();
        bus.raise();
        let mut w = Writer::new();
        w.map_open()
            .raw(b"cpu")
            .array_open()
            .array2()
            .int(1)
            .int(1)
            .array_close()
            .map_close()
            .end();
        let mut buffers = one_buffer();
        let err = assign(&w.into_bytes(), &ctx(&registry, &engine, &precision, &bus), &mut buffers).unwrap_err();
        assert_eq!(err, DecodeError::BusAlreadyTripped);
        assert!(buffers[0].is_empty());
    }
}
