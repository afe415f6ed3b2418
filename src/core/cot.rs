//! # CoT Event Model
//!
//! Typed view of a Cursor-on-Target event envelope:
//!
//! ```text
//! <event version="2.0" uid=".." type=".." how=".." time=".." start=".." stale="..">
//!     <point lat=".." lon=".." hae=".." ce=".." le=".."/>
//!     <detail>...</detail>
//! </event>
//! ```
//!
//! The `<detail>` block is kept as raw XML; the engine never interprets it.
//! Also builds the latency ping (`t-x-c-t`) and recognises its reply
//! (`t-x-c-t-r`).

use std::borrow::Cow;
use std::fmt::Write as _;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;

use crate::error::{ProtocolError, Result};

/// Type code of a ping request.
pub const PING_TYPE: &str = "t-x-c-t";
/// Type code of a ping reply.
pub const PONG_TYPE: &str = "t-x-c-t-r";

/// Circular/linear error used when a position is unknown.
pub const UNKNOWN_ERROR: f64 = 9_999_999.0;

/// Position and error ellipse of an event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    /// Height above ellipsoid, metres
    pub hae: f64,
    /// Circular error, metres
    pub ce: f64,
    /// Linear error, metres
    pub le: f64,
}

impl Point {
    pub fn unknown() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            hae: 0.0,
            ce: UNKNOWN_ERROR,
            le: UNKNOWN_ERROR,
        }
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::unknown()
    }
}

/// A single CoT event
#[derive(Debug, Clone, PartialEq)]
pub struct CotEvent {
    pub version: String,
    pub uid: String,
    pub event_type: String,
    pub how: String,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub point: Point,
    /// Inner XML of `<detail>`, if present
    pub detail: Option<String>,
}

impl CotEvent {
    /// New event stamped now, stale after `ttl`.
    pub fn new(uid: impl Into<String>, event_type: impl Into<String>, ttl: std::time::Duration) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(5));
        Self {
            version: "2.0".into(),
            uid: uid.into(),
            event_type: event_type.into(),
            how: "m-g".into(),
            time: now,
            start: now,
            stale: now + ttl,
            point: Point::unknown(),
            detail: None,
        }
    }

    /// Latency probe answered by TAK servers with a `t-x-c-t-r` event.
    pub fn ping(client_uid: &str) -> Self {
        let mut event = Self::new(
            format!("{client_uid}-ping"),
            PING_TYPE,
            std::time::Duration::from_secs(20),
        );
        event.how = "h-g-i-g-o".into();
        event.detail = Some(String::new());
        event
    }

    pub fn with_point(mut self, point: Point) -> Self {
        self.point = point;
        self
    }

    pub fn with_how(mut self, how: impl Into<String>) -> Self {
        self.how = how.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_ping(&self) -> bool {
        self.event_type == PING_TYPE
    }

    pub fn is_pong(&self) -> bool {
        self.event_type == PONG_TYPE
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.stale
    }

    /// Render the event as a standalone XML document.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>");
        let _ = write!(
            out,
            "<event version=\"{}\" uid=\"{}\" type=\"{}\" how=\"{}\" time=\"{}\" start=\"{}\" stale=\"{}\">",
            escape(&self.version),
            escape(&self.uid),
            escape(&self.event_type),
            escape(&self.how),
            format_time(&self.time),
            format_time(&self.start),
            format_time(&self.stale),
        );
        let _ = write!(
            out,
            "<point lat=\"{}\" lon=\"{}\" hae=\"{}\" ce=\"{}\" le=\"{}\"/>",
            self.point.lat, self.point.lon, self.point.hae, self.point.ce, self.point.le
        );
        match &self.detail {
            Some(detail) if !detail.is_empty() => {
                let _ = write!(out, "<detail>{detail}</detail>");
            }
            Some(_) => out.push_str("<detail/>"),
            None => {}
        }
        out.push_str("</event>");
        out
    }

    /// Parse one event document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut event: Option<CotEvent> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"event" => {
                    event = Some(Self::from_envelope(&e)?);
                }
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"point" => {
                    let Some(ev) = event.as_mut() else {
                        return Err(ProtocolError::Parse("<point> outside <event>".into()));
                    };
                    ev.point = parse_point(&e)?;
                }
                Event::Start(e) if e.name().as_ref() == b"detail" => {
                    let Some(ev) = event.as_mut() else {
                        return Err(ProtocolError::Parse("<detail> outside <event>".into()));
                    };
                    let span = reader.read_to_end(QName(b"detail")).map_err(xml_error)?;
                    ev.detail = Some(xml[span.start..span.end].to_string());
                }
                Event::Empty(e) if e.name().as_ref() == b"detail" => {
                    if let Some(ev) = event.as_mut() {
                        ev.detail = Some(String::new());
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        event.ok_or_else(|| ProtocolError::Parse("no <event> element".into()))
    }

    fn from_envelope(e: &BytesStart<'_>) -> Result<Self> {
        let mut version = String::from("2.0");
        let mut uid = None;
        let mut event_type = None;
        let mut how = String::new();
        let mut time = None;
        let mut start = None;
        let mut stale = None;

        for attr in e.attributes() {
            let attr = attr.map_err(|e| ProtocolError::Parse(e.to_string()))?;
            let value = attr.unescape_value().map_err(xml_error)?;
            match attr.key.as_ref() {
                b"version" => version = value.into_owned(),
                b"uid" => uid = Some(value.into_owned()),
                b"type" => event_type = Some(value.into_owned()),
                b"how" => how = value.into_owned(),
                b"time" => time = Some(parse_time(&value)?),
                b"start" => start = Some(parse_time(&value)?),
                b"stale" => stale = Some(parse_time(&value)?),
                _ => {}
            }
        }

        let uid = uid.ok_or_else(|| ProtocolError::Parse("event without uid".into()))?;
        let event_type =
            event_type.ok_or_else(|| ProtocolError::Parse("event without type".into()))?;
        let time = time.unwrap_or_else(Utc::now);
        Ok(Self {
            version,
            uid,
            event_type,
            how,
            time,
            start: start.unwrap_or(time),
            stale: stale.unwrap_or(time),
            point: Point::unknown(),
            detail: None,
        })
    }
}

/// Read only the `type` attribute of the envelope, without parsing the body.
pub fn peek_type(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.name().as_ref() != b"event" {
                    return None;
                }
                return e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == b"type")
                    .and_then(|a| a.unescape_value().ok().map(Cow::into_owned));
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// True when `xml` is a ping reply.
pub fn is_pong(xml: &str) -> bool {
    // substring check first
    xml.contains(PONG_TYPE) && peek_type(xml).as_deref() == Some(PONG_TYPE)
}

fn parse_point(e: &BytesStart<'_>) -> Result<Point> {
    let mut point = Point::unknown();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ProtocolError::Parse(e.to_string()))?;
        let value = attr.unescape_value().map_err(xml_error)?;
        let slot = match attr.key.as_ref() {
            b"lat" => &mut point.lat,
            b"lon" => &mut point.lon,
            b"hae" => &mut point.hae,
            b"ce" => &mut point.ce,
            b"le" => &mut point.le,
            _ => continue,
        };
        *slot = value
            .trim()
            .parse::<f64>()
            .map_err(|_| ProtocolError::Parse(format!("invalid point value '{value}'")))?;
    }
    Ok(point)
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ProtocolError::Parse(format!("invalid timestamp '{value}': {e}")))
}

fn xml_error(e: quick_xml::Error) -> ProtocolError {
    ProtocolError::Parse(e.to_string())
}
