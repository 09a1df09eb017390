use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Error, Result, Speed};

/// End-of-message character appended by the modem to transmitted text
pub const EOM: char = '♢';
/// Error character substituted by the modem for undecodable text
pub const ERR: char = '…';

/// Protocol message kind.
///
/// Kinds the modem application emits and accepts. Unknown kinds decode to
/// [`MessageKind::Other`] so newer application versions stay parseable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    // requests to the application
    RxGetText,
    RxGetCallActivity,
    RxGetBandActivity,
    RxGetSelectedCall,
    TxSendMessage,
    TxGetText,
    TxSetText,
    ModeGetSpeed,
    ModeSetSpeed,
    StationGetInfo,
    StationSetInfo,
    StationGetGrid,
    StationSetGrid,
    StationGetCallsign,
    InboxGetMessages,
    RigGetFreq,
    RigSetFreq,
    WindowRaise,
    Ping,

    // events from the application
    InboxMessages,
    RxSpot,
    RxDirected,
    RxSelectedCall,
    RxCallActivity,
    RxBandActivity,
    RxActivity,
    RxText,
    TxText,
    TxFrame,
    RigFreq,
    RigPtt,
    StationCallsign,
    StationGrid,
    StationInfo,
    StationStatus,
    ModeSpeed,

    /// Unrecognized kind, preserved verbatim for forward compatibility
    Other(String),
}

impl MessageKind {
    /// Wire representation of the kind
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::RxGetText => "RX.GET_TEXT",
            MessageKind::RxGetCallActivity => "RX.GET_CALL_ACTIVITY",
            MessageKind::RxGetBandActivity => "RX.GET_BAND_ACTIVITY",
            MessageKind::RxGetSelectedCall => "RX.GET_CALL_SELECTED",
            MessageKind::TxSendMessage => "TX.SEND_MESSAGE",
            MessageKind::TxGetText => "TX.GET_TEXT",
            MessageKind::TxSetText => "TX.SET_TEXT",
            MessageKind::ModeGetSpeed => "MODE.GET_SPEED",
            MessageKind::ModeSetSpeed => "MODE.SET_SPEED",
            MessageKind::StationGetInfo => "STATION.GET_INFO",
            MessageKind::StationSetInfo => "STATION.SET_INFO",
            MessageKind::StationGetGrid => "STATION.GET_GRID",
            MessageKind::StationSetGrid => "STATION.SET_GRID",
            MessageKind::StationGetCallsign => "STATION.GET_CALLSIGN",
            MessageKind::InboxGetMessages => "INBOX.GET_MESSAGES",
            MessageKind::RigGetFreq => "RIG.GET_FREQ",
            MessageKind::RigSetFreq => "RIG.SET_FREQ",
            MessageKind::WindowRaise => "WINDOW.RAISE",
            MessageKind::Ping => "PING",
            MessageKind::InboxMessages => "INBOX.MESSAGES",
            MessageKind::RxSpot => "RX.SPOT",
            MessageKind::RxDirected => "RX.DIRECTED",
            MessageKind::RxSelectedCall => "RX.CALL_SELECTED",
            MessageKind::RxCallActivity => "RX.CALL_ACTIVITY",
            MessageKind::RxBandActivity => "RX.BAND_ACTIVITY",
            MessageKind::RxActivity => "RX.ACTIVITY",
            MessageKind::RxText => "RX.TEXT",
            MessageKind::TxText => "TX.TEXT",
            MessageKind::TxFrame => "TX.FRAME",
            MessageKind::RigFreq => "RIG.FREQ",
            MessageKind::RigPtt => "RIG.PTT",
            MessageKind::StationCallsign => "STATION.CALLSIGN",
            MessageKind::StationGrid => "STATION.GRID",
            MessageKind::StationInfo => "STATION.INFO",
            MessageKind::StationStatus => "STATION.STATUS",
            MessageKind::ModeSpeed => "MODE.SPEED",
            MessageKind::Other(tag) => tag.as_str(),
        }
    }

    /// Parses a wire kind tag
    pub fn parse(tag: &str) -> MessageKind {
        match tag {
            "RX.GET_TEXT" => MessageKind::RxGetText,
            "RX.GET_CALL_ACTIVITY" => MessageKind::RxGetCallActivity,
            "RX.GET_BAND_ACTIVITY" => MessageKind::RxGetBandActivity,
            "RX.GET_CALL_SELECTED" => MessageKind::RxGetSelectedCall,
            "TX.SEND_MESSAGE" => MessageKind::TxSendMessage,
            "TX.GET_TEXT" => MessageKind::TxGetText,
            "TX.SET_TEXT" => MessageKind::TxSetText,
            "MODE.GET_SPEED" => MessageKind::ModeGetSpeed,
            "MODE.SET_SPEED" => MessageKind::ModeSetSpeed,
            "STATION.GET_INFO" => MessageKind::StationGetInfo,
            "STATION.SET_INFO" => MessageKind::StationSetInfo,
            "STATION.GET_GRID" => MessageKind::StationGetGrid,
            "STATION.SET_GRID" => MessageKind::StationSetGrid,
            "STATION.GET_CALLSIGN" => MessageKind::StationGetCallsign,
            "INBOX.GET_MESSAGES" => MessageKind::InboxGetMessages,
            "RIG.GET_FREQ" => MessageKind::RigGetFreq,
            "RIG.SET_FREQ" => MessageKind::RigSetFreq,
            "WINDOW.RAISE" => MessageKind::WindowRaise,
            "PING" => MessageKind::Ping,
            "INBOX.MESSAGES" => MessageKind::InboxMessages,
            "RX.SPOT" => MessageKind::RxSpot,
            "RX.DIRECTED" => MessageKind::RxDirected,
            "RX.CALL_SELECTED" => MessageKind::RxSelectedCall,
            "RX.CALL_ACTIVITY" => MessageKind::RxCallActivity,
            "RX.BAND_ACTIVITY" => MessageKind::RxBandActivity,
            "RX.ACTIVITY" => MessageKind::RxActivity,
            "RX.TEXT" => MessageKind::RxText,
            "TX.TEXT" => MessageKind::TxText,
            "TX.FRAME" => MessageKind::TxFrame,
            "RIG.FREQ" => MessageKind::RigFreq,
            "RIG.PTT" => MessageKind::RigPtt,
            "STATION.CALLSIGN" => MessageKind::StationCallsign,
            "STATION.GRID" => MessageKind::StationGrid,
            "STATION.INFO" => MessageKind::StationInfo,
            "STATION.STATUS" => MessageKind::StationStatus,
            "MODE.SPEED" => MessageKind::ModeSpeed,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

/// Directed-message command.
///
/// The fixed grammar of directives a station can address to another station
/// or group. Tokenization is deterministic: two-word commands are matched
/// before their one-word prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Heartbeat,
    HeartbeatSnr,
    Hb,
    Cq,
    Snr,
    SnrQuery,
    Grid,
    GridQuery,
    Info,
    InfoQuery,
    Status,
    StatusQuery,
    Hearing,
    HearingQuery,
    Query,
    QueryMsgs,
    QueryCall,
    Ack,
    Nack,
    AgnQuery,
    Msg,
    MsgTo,
    Yes,
    No,
    SeventyThree,
    Rr,
    Qsl,
    QslQuery,
    /// Plain directed text with no directive
    Freetext,
}

/// Two-word commands first so tokenization never stops at a prefix.
const COMMAND_TABLE: &[(&str, Command)] = &[
    ("HEARTBEAT SNR", Command::HeartbeatSnr),
    ("QUERY MSGS", Command::QueryMsgs),
    ("QUERY CALL", Command::QueryCall),
    ("MSG TO:", Command::MsgTo),
    ("HEARTBEAT", Command::Heartbeat),
    ("HB", Command::Hb),
    ("CQ", Command::Cq),
    ("SNR?", Command::SnrQuery),
    ("SNR", Command::Snr),
    ("GRID?", Command::GridQuery),
    ("GRID", Command::Grid),
    ("INFO?", Command::InfoQuery),
    ("INFO", Command::Info),
    ("STATUS?", Command::StatusQuery),
    ("STATUS", Command::Status),
    ("HEARING?", Command::HearingQuery),
    ("HEARING", Command::Hearing),
    ("QUERY", Command::Query),
    ("ACK", Command::Ack),
    ("NACK", Command::Nack),
    ("AGN?", Command::AgnQuery),
    ("MSG", Command::Msg),
    ("YES", Command::Yes),
    ("NO", Command::No),
    ("73", Command::SeventyThree),
    ("RR", Command::Rr),
    ("QSL?", Command::QslQuery),
    ("QSL", Command::Qsl),
];

impl Command {
    /// Wire token of the command ("" for freetext)
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Freetext => "",
            other => {
                COMMAND_TABLE
                    .iter()
                    .find(|(_, cmd)| cmd == other)
                    .map(|(token, _)| *token)
                    // every non-freetext variant appears in the table
                    .unwrap_or("")
            }
        }
    }

    /// Parses a command token as carried in a CMD param (leading space
    /// significant on the wire, insignificant here)
    pub fn parse(token: &str) -> Command {
        let token = token.trim();
        COMMAND_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == token)
            .map(|(_, cmd)| *cmd)
            .unwrap_or(Command::Freetext)
    }

    /// Whether the command requests a reply from the addressed station
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::SnrQuery
                | Command::GridQuery
                | Command::InfoQuery
                | Command::StatusQuery
                | Command::HearingQuery
                | Command::Query
                | Command::QueryMsgs
                | Command::QueryCall
                | Command::AgnQuery
                | Command::QslQuery
                | Command::Msg
                | Command::MsgTo
        )
    }

    /// Whether the command is an automatic reply kind
    pub fn is_autoreply(&self) -> bool {
        matches!(
            self,
            Command::HeartbeatSnr
                | Command::Snr
                | Command::Grid
                | Command::Info
                | Command::Status
                | Command::Hearing
                | Command::Yes
                | Command::No
                | Command::Ack
                | Command::Nack
        )
    }

    /// Whether the modem appends a checksum to the transmitted text.
    ///
    /// Checksummed text differs from the submitted text by a trailing
    /// token, which outgoing-lifecycle matching must ignore.
    pub fn carries_checksum(&self) -> bool {
        matches!(
            self,
            Command::Msg | Command::MsgTo | Command::Query | Command::QueryCall
        )
    }
}

/// Relay path separator in destination fields
pub const RELAY_MARKER: char = '>';

/// Normalizes a callsign or `@GROUP` address to its canonical form
pub fn normalize_callsign(call: &str) -> String {
    call.trim().to_ascii_uppercase()
}

/// A directed-message value tokenized into its grammar parts.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectedText {
    /// Origin callsign, when the value carries a `CALL:` prefix
    pub origin: Option<String>,
    /// Destination path; more than one entry means a relay
    pub path: Vec<String>,
    /// Recognized command
    pub command: Command,
    /// Remaining free text after the command
    pub text: String,
}

impl DirectedText {
    /// Tokenizes a directed value such as
    /// `"KT7RUN: @ALLCALL HEARTBEAT SNR -05"`.
    ///
    /// Origin and destination are recognized positionally; the command is
    /// matched longest-first against the fixed grammar; everything after it
    /// is free text. Grid and SNR fields being absent does not disturb
    /// tokenization.
    pub fn parse(value: &str) -> Result<DirectedText> {
        let cleaned: String = value
            .chars()
            .filter(|c| *c != EOM)
            .collect::<String>()
            .trim()
            .to_string();
        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(Error::malformed("empty directed value"));
        }

        let mut index = 0;
        let origin = tokens[0].strip_suffix(':').map(|call| {
            index += 1;
            normalize_callsign(call)
        });

        let path: Vec<String> = match tokens.get(index) {
            Some(destination) => {
                index += 1;
                destination
                    .split(RELAY_MARKER)
                    .filter(|part| !part.is_empty())
                    .map(normalize_callsign)
                    .collect()
            }
            None => return Err(Error::malformed("directed value has no destination")),
        };
        if path.is_empty() {
            return Err(Error::malformed("directed value has no destination"));
        }

        let remaining = &tokens[index..];
        let (command, consumed) = match_command(remaining);
        let text = remaining[consumed..].join(" ");

        Ok(DirectedText {
            origin,
            path,
            command,
            text,
        })
    }
}

/// Longest-first command match over whitespace tokens. Returns the command
/// and the number of tokens consumed.
fn match_command(tokens: &[&str]) -> (Command, usize) {
    for (wire, command) in COMMAND_TABLE {
        let words: Vec<&str> = wire.split(' ').collect();
        if tokens.len() >= words.len() && tokens[..words.len()] == words[..] {
            return (*command, words.len());
        }
    }
    (Command::Freetext, 0)
}

/// Typed message parameters.
///
/// Every field is optional; absence means the wire message did not carry
/// the param. Unrecognized params round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Origin callsign (wire param FROM)
    pub origin: Option<String>,
    /// Destination callsign or group address (wire param TO)
    pub destination: Option<String>,
    /// Directed command (wire param CMD)
    pub cmd: Option<Command>,
    /// Grid square
    pub grid: Option<String>,
    /// Signal-to-noise ratio in dB
    pub snr: Option<i32>,
    /// Dial plus offset frequency in Hz
    pub freq: Option<u64>,
    /// Dial frequency in Hz
    pub dial: Option<u64>,
    /// Pass-band offset frequency in Hz
    pub offset: Option<u32>,
    /// Modem speed of the signal
    pub speed: Option<Speed>,
    /// Reported time drift in seconds
    pub tdrift: Option<f64>,
    /// Epoch milliseconds the application stamped the event with
    pub utc: Option<i64>,
    /// Message text
    pub text: Option<String>,
    /// Request correlation id (wire param _ID)
    pub id: Option<i64>,
    /// Unrecognized params, preserved for forward compatibility
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// A protocol message: kind, free-text value, typed params.
///
/// Immutable after parse. Constructed once per inbound frame or once per
/// outbound submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub value: Option<String>,
    pub params: Params,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::TxSendMessage
    }
}

impl Message {
    /// Message of a kind with no value or params
    pub fn of_kind(kind: MessageKind) -> Message {
        Message {
            kind,
            value: None,
            params: Params::default(),
        }
    }

    /// Outgoing free-text transmission
    pub fn send_text(value: impl Into<String>) -> Message {
        Message {
            kind: MessageKind::TxSendMessage,
            value: Some(value.into().to_ascii_uppercase()),
            params: Params::default(),
        }
    }

    /// Outgoing directed transmission.
    ///
    /// Composes the value the modem expects: `DEST CMD TEXT`, double space
    /// between destination and text when there is no command. Destination
    /// and command are retained as typed params as well.
    pub fn directed(destination: &str, cmd: Option<Command>, text: &str) -> Message {
        let destination = normalize_callsign(destination);
        let text = text.to_ascii_uppercase();
        let value = match cmd {
            Some(Command::Freetext) | None => format!("{destination}  {text}"),
            Some(command) => format!("{destination} {} {text}", command.as_str()),
        };

        Message {
            kind: MessageKind::TxSendMessage,
            value: Some(value.trim_end().to_string()),
            params: Params {
                destination: Some(destination),
                cmd,
                text: Some(text),
                ..Params::default()
            },
        }
    }

    /// Outgoing network-presence transmission into the heartbeat sub-band
    pub fn heartbeat(grid: Option<&str>) -> Message {
        Message::directed("@HB", Some(Command::Heartbeat), grid.unwrap_or(""))
    }

    /// Offset relocation request; the dial frequency is unchanged
    pub fn set_offset(dial: u64, offset: u32) -> Message {
        Message {
            kind: MessageKind::RigSetFreq,
            value: None,
            params: Params {
                dial: Some(dial),
                offset: Some(offset),
                ..Params::default()
            },
        }
    }

    /// Modem speed change request
    pub fn set_speed(speed: Speed) -> Message {
        Message {
            kind: MessageKind::ModeSetSpeed,
            value: None,
            params: Params {
                speed: Some(speed),
                ..Params::default()
            },
        }
    }

    /// Whether the message addresses a station or group with a command
    pub fn is_directed(&self) -> bool {
        matches!(self.kind, MessageKind::RxDirected) || self.params.cmd.is_some()
    }

    /// Whether the message is addressed to the given callsign or group
    pub fn is_directed_to(&self, station: &str) -> bool {
        self.is_directed()
            && self.params.destination.as_deref() == Some(normalize_callsign(station).as_str())
    }

    /// Decodes a wire frame into a message.
    ///
    /// Fails with [`Error::MalformedMessage`] when the payload is not the
    /// expected JSON object shape. Unknown kinds and params are preserved,
    /// not dropped.
    pub fn decode(raw: &str) -> Result<Message> {
        let frame: WireFrame = serde_json::from_str(raw)
            .map_err(|e| Error::malformed(format!("{e}: {raw}")))?;

        let mut params = Params::default();
        for (key, value) in frame.params {
            match key.as_str() {
                "FROM" | "CALL" => {
                    if params.origin.is_none() {
                        params.origin = as_string(&value).map(|s| normalize_callsign(&s));
                    }
                }
                "TO" => params.destination = as_string(&value).map(|s| normalize_callsign(&s)),
                "CMD" => params.cmd = as_string(&value).map(|s| Command::parse(&s)),
                "GRID" => {
                    params.grid = as_string(&value)
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                }
                "SNR" => params.snr = as_i64(&value).map(|v| v as i32),
                "FREQ" => params.freq = as_i64(&value).map(|v| v as u64),
                "DIAL" => params.dial = as_i64(&value).map(|v| v as u64),
                "OFFSET" => params.offset = as_i64(&value).map(|v| v as u32),
                "SPEED" => {
                    params.speed = as_i64(&value)
                        .and_then(|code| Speed::from_submode(code as u32).ok())
                }
                "TDRIFT" => params.tdrift = value.as_f64(),
                "UTC" => params.utc = as_i64(&value),
                "TEXT" => params.text = as_string(&value),
                "_ID" => params.id = as_i64(&value),
                _ => {
                    params.extra.insert(key, value);
                }
            }
        }

        Ok(Message {
            kind: MessageKind::parse(frame.kind.trim()),
            value: frame.value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
            params,
        })
    }

    /// Encodes the message to its wire frame (no trailing newline).
    ///
    /// Exact inverse of [`Message::decode`]: every set param is emitted, so
    /// `decode(encode(m)) == m` for any representable message.
    pub fn encode(&self) -> String {
        let mut params = Map::new();
        let p = &self.params;
        if let Some(origin) = &p.origin {
            params.insert("FROM".into(), Value::String(origin.clone()));
        }
        if let Some(destination) = &p.destination {
            params.insert("TO".into(), Value::String(destination.clone()));
        }
        if let Some(cmd) = &p.cmd {
            // leading space is the wire convention for command params
            params.insert("CMD".into(), Value::String(format!(" {}", cmd.as_str()).trim_end().to_string()));
        }
        if let Some(grid) = &p.grid {
            params.insert("GRID".into(), Value::String(grid.clone()));
        }
        if let Some(snr) = p.snr {
            params.insert("SNR".into(), Value::from(snr));
        }
        if let Some(freq) = p.freq {
            params.insert("FREQ".into(), Value::from(freq));
        }
        if let Some(dial) = p.dial {
            params.insert("DIAL".into(), Value::from(dial));
        }
        if let Some(offset) = p.offset {
            params.insert("OFFSET".into(), Value::from(offset));
        }
        if let Some(speed) = p.speed {
            params.insert("SPEED".into(), Value::from(speed.submode()));
        }
        if let Some(tdrift) = p.tdrift {
            params.insert("TDRIFT".into(), Value::from(tdrift));
        }
        if let Some(utc) = p.utc {
            params.insert("UTC".into(), Value::from(utc));
        }
        if let Some(text) = &p.text {
            params.insert("TEXT".into(), Value::String(text.clone()));
        }
        if let Some(id) = p.id {
            params.insert("_ID".into(), Value::from(id));
        }
        for (key, value) in &p.extra {
            params.insert(key.clone(), value.clone());
        }

        let frame = serde_json::json!({
            "params": params,
            "type": self.kind.as_str(),
            "value": self.value.clone().unwrap_or_default(),
        });
        frame.to_string()
    }
}

/// Raw wire shape of every frame.
#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
}

/// Reads a JSON value as a string, accepting numbers for tolerant parsing
fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads a JSON value as an integer, accepting "+05"-style signed strings
/// and floats the application sometimes emits
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().trim_start_matches('+').parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for tag in ["RX.DIRECTED", "TX.FRAME", "RIG.PTT", "PING", "STATION.STATUS"] {
            assert_eq!(MessageKind::parse(tag).as_str(), tag);
        }
        let unknown = MessageKind::parse("RX.FUTURE_THING");
        assert_eq!(unknown, MessageKind::Other("RX.FUTURE_THING".to_string()));
        assert_eq!(unknown.as_str(), "RX.FUTURE_THING");
    }

    #[test]
    fn test_command_tokenization_longest_first() {
        let (cmd, consumed) = match_command(&["HEARTBEAT", "SNR", "-05"]);
        assert_eq!(cmd, Command::HeartbeatSnr);
        assert_eq!(consumed, 2);

        let (cmd, consumed) = match_command(&["HEARTBEAT", "FN42"]);
        assert_eq!(cmd, Command::Heartbeat);
        assert_eq!(consumed, 1);

        let (cmd, consumed) = match_command(&["HELLO", "THERE"]);
        assert_eq!(cmd, Command::Freetext);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_directed_parse_full() {
        let parsed = DirectedText::parse("KT7RUN: @ALLCALL HEARTBEAT SNR -05 ♢").unwrap();
        assert_eq!(parsed.origin.as_deref(), Some("KT7RUN"));
        assert_eq!(parsed.path, vec!["@ALLCALL".to_string()]);
        assert_eq!(parsed.command, Command::HeartbeatSnr);
        assert_eq!(parsed.text, "-05");
    }

    #[test]
    fn test_directed_parse_without_optional_fields() {
        // no origin prefix, no grid, no snr
        let parsed = DirectedText::parse("N0CALL SNR?").unwrap();
        assert_eq!(parsed.origin, None);
        assert_eq!(parsed.path, vec!["N0CALL".to_string()]);
        assert_eq!(parsed.command, Command::SnrQuery);
        assert_eq!(parsed.text, "");
    }

    #[test]
    fn test_directed_parse_relay_path() {
        let parsed = DirectedText::parse("KT7RUN: N0CALL>W1AW HELLO VIA RELAY").unwrap();
        assert_eq!(parsed.path, vec!["N0CALL".to_string(), "W1AW".to_string()]);
        assert_eq!(parsed.command, Command::Freetext);
        assert_eq!(parsed.text, "HELLO VIA RELAY");
    }

    #[test]
    fn test_directed_parse_empty_is_error() {
        assert!(DirectedText::parse("  ").is_err());
        assert!(DirectedText::parse("KT7RUN:").is_err());
    }

    #[test]
    fn test_decode_directed() {
        let raw = r#"{"params":{"CMD":" HEARTBEAT","FROM":"kt7run","TO":"@HB","GRID":" FN42 ","SNR":"+12","OFFSET":812.0,"TDRIFT":0.25,"UTC":1700000000000,"_ID":-1},"type":"RX.DIRECTED","value":"KT7RUN: @HB HEARTBEAT FN42"}"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.kind, MessageKind::RxDirected);
        assert_eq!(msg.params.origin.as_deref(), Some("KT7RUN"));
        assert_eq!(msg.params.destination.as_deref(), Some("@HB"));
        assert_eq!(msg.params.cmd, Some(Command::Heartbeat));
        assert_eq!(msg.params.grid.as_deref(), Some("FN42"));
        assert_eq!(msg.params.snr, Some(12));
        assert_eq!(msg.params.offset, Some(812));
        assert_eq!(msg.params.tdrift, Some(0.25));
        assert_eq!(msg.params.id, Some(-1));
    }

    #[test]
    fn test_decode_preserves_unknown_params() {
        let raw = r#"{"params":{"FUTURE":"x"},"type":"RX.SPOT","value":""}"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(
            msg.params.extra.get("FUTURE"),
            Some(&Value::String("x".to_string()))
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            Message::decode("not json"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"no_type": true}"#),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let messages = vec![
            Message::of_kind(MessageKind::Ping),
            Message::send_text("hello world"),
            Message::directed("n0call", Some(Command::SnrQuery), ""),
            Message::directed("@allcall", None, "cq cq"),
            Message::heartbeat(Some("FN42")),
            Message::set_offset(7_078_000, 1500),
            Message::set_speed(Speed::Fast),
            Message {
                kind: MessageKind::RxDirected,
                value: Some("KT7RUN: @TIME SYNC".to_string()),
                params: Params {
                    origin: Some("KT7RUN".to_string()),
                    destination: Some("@TIME".to_string()),
                    cmd: Some(Command::Freetext),
                    snr: Some(-7),
                    offset: Some(988),
                    speed: Some(Speed::Normal),
                    tdrift: Some(-0.375),
                    utc: Some(1_700_000_000_000),
                    ..Params::default()
                },
            },
        ];

        for msg in messages {
            let decoded = Message::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg, "round trip failed for {:?}", msg.kind);
        }
    }

    #[test]
    fn test_directed_compose_double_space_without_command() {
        let msg = Message::directed("N0CALL", None, "hello");
        assert_eq!(msg.value.as_deref(), Some("N0CALL  HELLO"));

        let msg = Message::directed("N0CALL", Some(Command::Ack), "");
        assert_eq!(msg.value.as_deref(), Some("N0CALL ACK"));
    }

    #[test]
    fn test_is_directed_to() {
        let msg = Message::directed("@hb", Some(Command::Heartbeat), "");
        assert!(msg.is_directed_to("@HB"));
        assert!(!msg.is_directed_to("@TIME"));
    }
}
