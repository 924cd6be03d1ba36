// ABOUTME: Routes completed instructions to core-handled opcodes or the backend's callbacks
// ABOUTME: Unknown opcodes are ignored for forward compatibility; handler failures stop the connection

use crate::backend::Backend;
use crate::connection::ConnectionState;
use crate::instruction::Instruction;
use crate::status::{GuacError, GuacResult, Status};

/// Dispatches one completed instruction (§4.4).
///
/// Core opcodes (`sync`, `mouse`, `key`, `clipboard`, `size`, `disconnect`)
/// are handled here, forwarding to `backend` where the table says to.
/// Anything else is silently ignored — an unrecognized opcode is forward
/// compatibility, not an error.
pub async fn dispatch(
    instr: &Instruction,
    backend: &mut dyn Backend,
    state: &ConnectionState,
) -> GuacResult<()> {
    match instr.opcode() {
        "sync" => handle_sync(instr, state),
        "mouse" => handle_mouse(instr, backend).await,
        "key" => handle_key(instr, backend).await,
        "clipboard" => handle_clipboard(instr, backend).await,
        "size" => handle_size(instr, backend).await,
        "blob" => handle_blob(instr, state),
        "end" => handle_end(instr, state),
        "disconnect" => {
            state.stop();
            Ok(())
        }
        _ => Ok(()),
    }
}

fn missing_arg(opcode: &str, name: &str) -> GuacError {
    GuacError::new(
        Status::ProtocolError,
        format!("{opcode}: missing {name} argument"),
    )
}

fn parse_i64(opcode: &str, name: &str, raw: &str) -> GuacResult<i64> {
    raw.parse()
        .map_err(|_| GuacError::new(Status::ProtocolError, format!("{opcode}: {name} {raw:?} is not an integer")))
}

fn handle_sync(instr: &Instruction, state: &ConnectionState) -> GuacResult<()> {
    let raw = instr.arg(0).ok_or_else(|| missing_arg("sync", "timestamp"))?;
    let timestamp = parse_i64("sync", "timestamp", raw)?;

    state.record_received(timestamp);

    // §3 invariant: last_received_ts <= last_sent_ts. A client claiming a
    // timestamp ahead of what we've actually sent is fabricating data.
    if timestamp > state.last_sent_ts() {
        return Err(GuacError::new(
            Status::ProtocolError,
            "client sync timestamp is ahead of the last timestamp this server sent",
        ));
    }

    Ok(())
}

async fn handle_mouse(instr: &Instruction, backend: &mut dyn Backend) -> GuacResult<()> {
    let x = parse_i64("mouse", "x", instr.arg(0).ok_or_else(|| missing_arg("mouse", "x"))?)?;
    let y = parse_i64("mouse", "y", instr.arg(1).ok_or_else(|| missing_arg("mouse", "y"))?)?;
    let mask_raw = instr.arg(2).ok_or_else(|| missing_arg("mouse", "button-mask"))?;
    let mask = parse_i64("mouse", "button-mask", mask_raw)?;

    backend.mouse(x as i32, y as i32, mask as u8).await
}

async fn handle_key(instr: &Instruction, backend: &mut dyn Backend) -> GuacResult<()> {
    let keysym = parse_i64(
        "key",
        "keysym",
        instr.arg(0).ok_or_else(|| missing_arg("key", "keysym"))?,
    )?;
    let pressed_raw = instr.arg(1).ok_or_else(|| missing_arg("key", "pressed"))?;
    let pressed = parse_i64("key", "pressed", pressed_raw)? != 0;

    backend.key(keysym, pressed).await
}

async fn handle_clipboard(instr: &Instruction, backend: &mut dyn Backend) -> GuacResult<()> {
    let text = instr.arg(0).ok_or_else(|| missing_arg("clipboard", "text"))?;
    backend.clipboard(text).await
}

/// `blob,stream,data` — decodes the base64 payload and routes it to
/// whatever sink the stream was opened with (§3 Stream, §4.4). A blob
/// against an index nobody allocated is logged and otherwise ignored,
/// matching the "unrecognized is forward compatibility, not an error"
/// posture used for unknown opcodes.
fn handle_blob(instr: &Instruction, state: &ConnectionState) -> GuacResult<()> {
    let index_raw = instr.arg(0).ok_or_else(|| missing_arg("blob", "stream"))?;
    let index = parse_i64("blob", "stream", index_raw)? as usize;
    let encoded = instr.arg(1).ok_or_else(|| missing_arg("blob", "data"))?;
    let data = crate::socket::decode_base64(encoded.as_bytes());

    if !state.dispatch_stream_blob(index, &data) {
        tracing::debug!(index, "blob for unknown or closed stream, ignoring");
    }
    Ok(())
}

/// `end,stream` — closes the stream, notifying its sink if any (§3 Stream).
fn handle_end(instr: &Instruction, state: &ConnectionState) -> GuacResult<()> {
    let index_raw = instr.arg(0).ok_or_else(|| missing_arg("end", "stream"))?;
    let index = parse_i64("end", "stream", index_raw)? as usize;

    if !state.dispatch_stream_end(index) {
        tracing::debug!(index, "end for unknown or closed stream, ignoring");
    }
    Ok(())
}

async fn handle_size(instr: &Instruction, backend: &mut dyn Backend) -> GuacResult<()> {
    let width = parse_i64("size", "width", instr.arg(0).ok_or_else(|| missing_arg("size", "width"))?)?;
    let height = parse_i64("size", "height", instr.arg(1).ok_or_else(|| missing_arg("size", "height"))?)?;
    let dpi = match instr.arg(2) {
        Some(raw) => Some(parse_i64("size", "dpi", raw)? as i32),
        None => None,
    };

    backend.size(width as i32, height as i32, dpi).await
}
