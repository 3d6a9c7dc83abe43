//! Framed codec for the line protocol.
//!
//! Wraps `LinesCodec` and layers the `##` frame grammar on top, so the rest
//! of the crate only ever sees [`Frame`] values. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, in-memory duplexes).

use futures::{Stream, StreamExt};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::bridge::protocol::{ControlFrame, Frame};
use crate::status::SyntheticFrame;

/// Errors decoding the protocol stream.
///
/// Everything here is a protocol violation that terminates the session,
/// except the transparent I/O case.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("i/o error on protocol stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol line exceeds the maximum length")]
    LineTooLong,
    #[error("unknown opcode in control frame: {0:?}")]
    UnknownOpcode(String),
    #[error("missing argument for {opcode}")]
    MissingArgument { opcode: &'static str },
    #[error("non-integer argument for {opcode}: {value:?}")]
    BadInteger { opcode: &'static str, value: String },
}

impl From<LinesCodecError> for DecodeError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => DecodeError::LineTooLong,
            LinesCodecError::Io(e) => DecodeError::Io(e),
        }
    }
}

/// Codec turning wire lines into [`Frame`]s and back.
pub struct FrameCodec {
    inner: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        match self.inner.decode(src)? {
            Some(line) => Ok(Some(parse_line(&line)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        match self.inner.decode_eof(src)? {
            Some(line) => Ok(Some(parse_line(&line)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DecodeError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), DecodeError> {
        self.inner.encode(frame.to_line(), dst)?;
        Ok(())
    }
}

/// Decode one wire line.
///
/// Lines not starting with `##` are diagnostics. Control lines split on
/// commas with tokens trimmed, except that WARNING/WARNING_TRACE/FAILED
/// treat everything after the first comma as the message.
pub fn parse_line(line: &str) -> Result<Frame, DecodeError> {
    let Some(rest) = line.strip_prefix("##") else {
        return Ok(Frame::Diagnostic(line.to_string()));
    };
    let (opcode, tail) = match rest.split_once(',') {
        Some((opcode, tail)) => (opcode.trim(), Some(tail)),
        None => (rest.trim(), None),
    };

    fn split_args<'a>(
        tail: Option<&'a str>,
        opcode: &'static str,
    ) -> Result<Vec<&'a str>, DecodeError> {
        tail.map(|t| t.split(',').map(str::trim).collect())
            .ok_or(DecodeError::MissingArgument { opcode })
    }

    fn message_arg(tail: Option<&str>, opcode: &'static str) -> Result<String, DecodeError> {
        tail.map(|t| t.trim().to_string())
            .ok_or(DecodeError::MissingArgument { opcode })
    }

    let frame = match opcode {
        "TASK" => {
            let args = split_args(tail, "TASK")?;
            let [name, total] = args.as_slice() else {
                return Err(DecodeError::MissingArgument { opcode: "TASK" });
            };
            ControlFrame::Task {
                name: name.to_string(),
                total: parse_int("TASK", total)?,
            }
        }
        "SUBTASK" => {
            let args = split_args(tail, "SUBTASK")?;
            let name = args
                .first()
                .ok_or(DecodeError::MissingArgument { opcode: "SUBTASK" })?;
            ControlFrame::SubTask {
                name: name.to_string(),
            }
        }
        "SUBTASK_DONE" => ControlFrame::SubTaskDone,
        "WORK" => {
            let args = split_args(tail, "WORK")?;
            let units = args
                .first()
                .ok_or(DecodeError::MissingArgument { opcode: "WORK" })?;
            ControlFrame::Work {
                units: parse_int("WORK", units)?,
            }
        }
        "WARNING" => ControlFrame::Warning {
            message: message_arg(tail, "WARNING")?,
        },
        "WARNING_TRACE" => ControlFrame::WarningTrace {
            message: message_arg(tail, "WARNING_TRACE")?,
        },
        "FAILED" => ControlFrame::Failed {
            message: message_arg(tail, "FAILED")?,
        },
        "DONE" => ControlFrame::Done,
        "CANCEL" => ControlFrame::Cancel,
        other => return Err(DecodeError::UnknownOpcode(other.to_string())),
    };
    Ok(Frame::Control(frame))
}

fn parse_int(opcode: &'static str, value: &str) -> Result<u32, DecodeError> {
    value.parse().map_err(|_| DecodeError::BadInteger {
        opcode,
        value: value.to_string(),
    })
}

/// Parse one `\tat declaring.method(File.java:NN)` stack-frame line.
///
/// Returns `None` for anything that does not fit the shape, such as
/// `... 3 more` or `(Native Method)` lines; callers drop those.
pub fn parse_stack_frame(line: &str) -> Option<SyntheticFrame> {
    let rest = line.trim_start_matches('\t').strip_prefix("at ")?;
    let open = rest.find('(')?;
    let qualified = rest[..open].trim();
    let inner = rest[open + 1..].trim_end().strip_suffix(')')?;
    let (file, line_no) = inner.rsplit_once(':')?;
    let line_no: u32 = line_no.parse().ok()?;
    let (declaring, method) = qualified
        .rsplit_once('.')
        .unwrap_or(("", qualified));
    Some(SyntheticFrame {
        declaring: declaring.to_string(),
        method: method.to_string(),
        file: file.to_string(),
        line: line_no,
    })
}

/// The exception payload following a WARNING/WARNING_TRACE/FAILED frame.
#[derive(Debug, Default)]
pub struct ExceptionPayload {
    /// The type-and-message line, when the worker sent one.
    pub summary: Option<String>,
    pub frames: Vec<SyntheticFrame>,
    /// Tab-indented lines consumed, parsed or not.
    pub indented_lines: usize,
    /// The terminating non-indented frame, to be dispatched normally.
    pub leftover: Option<Frame>,
}

/// Read the exception payload off the frame stream.
///
/// Consumes the type-and-message line, then every tab-indented line. The
/// first non-indented line is not part of the payload and comes back in
/// `leftover` so the caller can dispatch it.
pub async fn read_exception_payload<S>(frames: &mut S) -> Result<ExceptionPayload, DecodeError>
where
    S: Stream<Item = Result<Frame, DecodeError>> + Unpin,
{
    let mut payload = ExceptionPayload::default();

    match frames.next().await {
        None => return Ok(payload),
        Some(item) => match item? {
            Frame::Diagnostic(line) if !line.starts_with('\t') => {
                payload.summary = Some(line);
            }
            Frame::Diagnostic(line) => {
                // Worker skipped the type line; this is already a frame.
                payload.indented_lines += 1;
                if let Some(frame) = parse_stack_frame(&line) {
                    payload.frames.push(frame);
                }
            }
            other => {
                payload.leftover = Some(other);
                return Ok(payload);
            }
        },
    }

    loop {
        match frames.next().await {
            None => return Ok(payload),
            Some(item) => match item? {
                Frame::Diagnostic(line) if line.starts_with('\t') => {
                    payload.indented_lines += 1;
                    if let Some(frame) = parse_stack_frame(&line) {
                        payload.frames.push(frame);
                    }
                }
                other => {
                    payload.leftover = Some(other);
                    return Ok(payload);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn decode_all(input: &str) -> Vec<Result<Frame, DecodeError>> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(input.as_bytes());
        let mut out = Vec::new();
        loop {
            match codec.decode_eof(&mut buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => {
                    out.push(Err(e));
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn decodes_control_and_diagnostic_lines() {
        let frames = decode_all("banner line\n##TASK, Scan, 100\n##WORK, 3\n##DONE\n");
        let frames: Vec<Frame> = frames.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            frames,
            vec![
                Frame::diagnostic("banner line"),
                Frame::Control(ControlFrame::Task {
                    name: "Scan".to_string(),
                    total: 100,
                }),
                Frame::Control(ControlFrame::Work { units: 3 }),
                Frame::Control(ControlFrame::Done),
            ]
        );
    }

    #[test]
    fn encode_then_decode_roundtrips() {
        let original = Frame::Control(ControlFrame::SubTask {
            name: "resolving types".to_string(),
        });
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn warning_message_keeps_embedded_commas() {
        let frame = parse_line("##WARNING, rule X17 matched, but no fix is known").unwrap();
        assert_eq!(
            frame,
            Frame::Control(ControlFrame::Warning {
                message: "rule X17 matched, but no fix is known".to_string(),
            })
        );
    }

    #[test]
    fn unknown_opcode_is_a_decode_error() {
        assert!(matches!(
            parse_line("##BOGUS, 1"),
            Err(DecodeError::UnknownOpcode(op)) if op == "BOGUS"
        ));
    }

    #[test]
    fn non_integer_work_is_a_decode_error() {
        assert!(matches!(
            parse_line("##WORK, lots"),
            Err(DecodeError::BadInteger { opcode: "WORK", .. })
        ));
    }

    #[test]
    fn task_with_missing_total_is_a_decode_error() {
        assert!(matches!(
            parse_line("##TASK, Scan"),
            Err(DecodeError::MissingArgument { opcode: "TASK" })
        ));
    }

    #[test]
    fn tab_indented_line_is_a_diagnostic() {
        let frame = parse_line("\tat com.tool.Scanner.scan(Scanner.java:17)").unwrap();
        assert!(matches!(frame, Frame::Diagnostic(_)));
    }

    #[test]
    fn parses_stack_frame_line() {
        let frame = parse_stack_frame("\tat com.tool.Scanner.scan(Scanner.java:17)").unwrap();
        assert_eq!(frame.declaring, "com.tool.Scanner");
        assert_eq!(frame.method, "scan");
        assert_eq!(frame.file, "Scanner.java");
        assert_eq!(frame.line, 17);
    }

    #[test]
    fn unqualified_method_has_empty_declaring_type() {
        let frame = parse_stack_frame("\tat main(Main.java:3)").unwrap();
        assert_eq!(frame.declaring, "");
        assert_eq!(frame.method, "main");
    }

    #[test]
    fn native_method_line_is_dropped() {
        assert!(parse_stack_frame("\tat com.tool.Jni.call(Native Method)").is_none());
        assert!(parse_stack_frame("\t... 3 more").is_none());
    }

    #[tokio::test]
    async fn payload_roundtrip_counts_frames() {
        // Pins the line-consumption order: one type line, every indented
        // line consumed, terminator handed back untouched.
        let mut frames = stream::iter(vec![
            Ok(Frame::diagnostic("java.lang.IllegalStateException : bad")),
            Ok(Frame::diagnostic("\tat com.tool.A.run(A.java:1)")),
            Ok(Frame::diagnostic("\tat com.tool.B.run(B.java:2)")),
            Ok(Frame::diagnostic("\t... 5 more")),
            Ok(Frame::Control(ControlFrame::Done)),
        ]);

        let payload = read_exception_payload(&mut frames).await.unwrap();
        assert_eq!(
            payload.summary.as_deref(),
            Some("java.lang.IllegalStateException : bad")
        );
        assert_eq!(payload.indented_lines, 3);
        assert_eq!(payload.frames.len(), 2);
        assert_eq!(payload.leftover, Some(Frame::Control(ControlFrame::Done)));
    }

    #[tokio::test]
    async fn payload_with_zero_frames_is_valid() {
        let mut frames = stream::iter(vec![
            Ok(Frame::diagnostic("scan warning: deprecated rule")),
            Ok(Frame::Control(ControlFrame::Work { units: 1 })),
        ]);

        let payload = read_exception_payload(&mut frames).await.unwrap();
        assert_eq!(payload.summary.as_deref(), Some("scan warning: deprecated rule"));
        assert!(payload.frames.is_empty());
        assert_eq!(
            payload.leftover,
            Some(Frame::Control(ControlFrame::Work { units: 1 }))
        );
    }

    #[tokio::test]
    async fn missing_payload_hands_back_the_control_frame() {
        let mut frames = stream::iter(vec![Ok(Frame::Control(ControlFrame::Done))]);
        let payload = read_exception_payload(&mut frames).await.unwrap();
        assert!(payload.summary.is_none());
        assert_eq!(payload.leftover, Some(Frame::Control(ControlFrame::Done)));
    }

    #[tokio::test]
    async fn payload_at_eof_keeps_what_was_read() {
        let mut frames = stream::iter(vec![
            Ok(Frame::diagnostic("java.io.IOException : gone")),
            Ok(Frame::diagnostic("\tat com.tool.C.close(C.java:9)")),
        ]);
        let payload = read_exception_payload(&mut frames).await.unwrap();
        assert_eq!(payload.frames.len(), 1);
        assert!(payload.leftover.is_none());
    }
}
