use crate::error::DashError;
use crate::mpd::{
    AdaptationSet, Addressing, ContentProtection, Manifest, Period, Representation,
    RepresentationKind, SegmentBase, SegmentTemplate, TimelineEntry, TrackType,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};

/// Where BaseURL / pssh text content currently being read belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TextTarget {
    #[default]
    None,
    MpdBaseUrl,
    PeriodBaseUrl,
    Pssh,
}

/// Mutable parse state: the "current" object at every level of the tree.
/// Element open handlers populate the current object, close handlers perform
/// inheritance and validation, then push it into the parent.
#[derive(Default)]
struct ParseState {
    manifest: Manifest,
    period: Option<Period>,
    adaptation: Option<AdaptationSet>,
    adaptation_content_type: String,
    adaptation_template: Option<SegmentTemplate>,
    representation: Option<RepresentationBuilder>,
    template: Option<SegmentTemplate>,
    segment_base: Option<SegmentBase>,
    timeline: Option<Vec<TimelineEntry>>,
    protection: Option<ContentProtection>,
    text_target: TextTarget,
}

#[derive(Default)]
struct RepresentationBuilder {
    id: String,
    bandwidth: u64,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<f64>,
    audio_sampling_rate: Option<u32>,
    audio_channels: Option<u32>,
    template: Option<SegmentTemplate>,
    segment_base: Option<SegmentBase>,
}

/// Parses an MPD document into a [`Manifest`].
///
/// Single forward pass over the XML; see [`ParseState`] for the inheritance
/// model. A representation that ends up with neither a SegmentTemplate nor a
/// SegmentBase is a fatal parse error.
pub fn parse_mpd(xml: &[u8]) -> Result<Manifest, DashError> {
    let text = std::str::from_utf8(xml)?;
    let mut reader = Reader::from_str(text);
    let mut buf = Vec::new();

    let mut state = ParseState {
        manifest: Manifest {
            content_hash: content_hash(xml),
            ..Manifest::default()
        },
        ..ParseState::default()
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name().to_owned();
                let tag = local_name(std::str::from_utf8(name.as_ref())?);
                open_element(&mut state, tag, e)?;
            }
            Ok(Event::Empty(ref e)) => {
                let name = e.name().to_owned();
                let tag = local_name(std::str::from_utf8(name.as_ref())?);
                open_element(&mut state, tag, e)?;
                close_element(&mut state, tag)?;
            }
            Ok(Event::End(ref e)) => {
                let name = e.name().to_owned();
                let tag = local_name(std::str::from_utf8(name.as_ref())?);
                close_element(&mut state, tag)?;
            }
            Ok(Event::Text(ref t)) => {
                let text = t.unescape()?.trim().to_string();
                if !text.is_empty() {
                    handle_text(&mut state, &text)?;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(DashError::Parse(e.to_string())),
        }
        buf.clear();
    }

    if state.manifest.periods.is_empty() {
        return Err(DashError::Parse("MPD contains no Period".into()));
    }
    Ok(state.manifest)
}

pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Strips an XML namespace prefix (`cenc:pssh` -> `pssh`).
fn local_name(tag: &str) -> &str {
    tag.rsplit_once(':').map(|(_, local)| local).unwrap_or(tag)
}

fn open_element(state: &mut ParseState, tag: &str, e: &BytesStart) -> Result<(), DashError> {
    match tag {
        "MPD" => {
            for attr in e.attributes() {
                let attr = attr?;
                let value = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"mediaPresentationDuration" => {
                        state.manifest.duration_us = Some(parse_duration_us(&value)?);
                    }
                    b"type" => state.manifest.dynamic = value.as_ref() == "dynamic",
                    b"minBufferTime" => {
                        state.manifest.min_buffer_time_us = Some(parse_duration_us(&value)?);
                    }
                    b"minimumUpdatePeriod" => {
                        state.manifest.minimum_update_period_us = Some(parse_duration_us(&value)?);
                    }
                    b"availabilityStartTime" => {
                        state.manifest.availability_start_time =
                            value.parse().map(Some).unwrap_or(None);
                    }
                    _ => {}
                }
            }
        }
        "Period" => {
            let mut period = Period::default();
            for attr in e.attributes() {
                let attr = attr?;
                let value = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"id" => period.id = value.to_string(),
                    b"start" => period.start_us = parse_duration_us(&value)?,
                    b"duration" => period.duration_us = Some(parse_duration_us(&value)?),
                    _ => {}
                }
            }
            state.period = Some(period);
        }
        "AdaptationSet" => {
            let mut set = AdaptationSet::default();
            state.adaptation_content_type = String::new();
            for attr in e.attributes() {
                let attr = attr?;
                let value = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"mimeType" => set.mime_type = value.to_string(),
                    b"contentType" => state.adaptation_content_type = value.to_string(),
                    b"lang" => set.lang = value.to_string(),
                    b"width" => set.width = value.parse().ok(),
                    b"height" => set.height = value.parse().ok(),
                    b"frameRate" => set.frame_rate = parse_frame_rate(&value),
                    b"audioSamplingRate" => set.audio_sampling_rate = value.parse().ok(),
                    _ => {}
                }
            }
            state.adaptation = Some(set);
            state.adaptation_template = None;
        }
        "ContentComponent" => {
            // A content type given on the component wins over inference.
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"contentType" {
                    state.adaptation_content_type = attr.unescape_value()?.to_string();
                }
            }
        }
        "Representation" => {
            let mut rep = RepresentationBuilder::default();
            for attr in e.attributes() {
                let attr = attr?;
                let value = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"id" => rep.id = value.to_string(),
                    b"bandwidth" => {
                        rep.bandwidth = value
                            .parse()
                            .map_err(|_| DashError::Parse(format!("bad bandwidth: {value}")))?;
                    }
                    b"width" => rep.width = value.parse().ok(),
                    b"height" => rep.height = value.parse().ok(),
                    b"frameRate" => rep.frame_rate = parse_frame_rate(&value),
                    b"audioSamplingRate" => rep.audio_sampling_rate = value.parse().ok(),
                    _ => {}
                }
            }
            state.representation = Some(rep);
        }
        "AudioChannelConfiguration" => {
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"value" {
                    let channels = attr.unescape_value()?.parse().ok();
                    if let Some(rep) = state.representation.as_mut() {
                        rep.audio_channels = channels;
                    } else if let Some(set) = state.adaptation.as_mut() {
                        set.audio_channels = channels;
                    }
                }
            }
        }
        "Role" => {
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"value" {
                    let value = attr.unescape_value()?;
                    if value.contains("subtitle") || value.contains("caption") {
                        state.adaptation_content_type = "subtitle".into();
                    }
                }
            }
        }
        "Accessibility" | "Rating" => {
            // Recognized but carry nothing the client acts on.
        }
        "SegmentTemplate" => {
            let mut template = SegmentTemplate {
                timescale: 1,
                start_number: 1,
                ..SegmentTemplate::default()
            };
            for attr in e.attributes() {
                let attr = attr?;
                let value = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"initialization" => template.initialization = value.to_string(),
                    b"media" => template.media = value.to_string(),
                    b"startNumber" => template.start_number = value.parse().unwrap_or(1),
                    b"timescale" => template.timescale = value.parse().unwrap_or(1),
                    b"duration" => template.duration_ticks = value.parse().ok(),
                    _ => {}
                }
            }
            state.template = Some(template);
        }
        "SegmentTimeline" => {
            state.timeline = Some(Vec::new());
        }
        "S" => {
            let timeline = state
                .timeline
                .as_mut()
                .ok_or_else(|| DashError::Parse("S element outside SegmentTimeline".into()))?;
            let mut start = None;
            let mut duration = 0u64;
            let mut repeat = 0u64;
            for attr in e.attributes() {
                let attr = attr?;
                let value = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"t" => start = value.parse().ok(),
                    b"d" => {
                        duration = value
                            .parse()
                            .map_err(|_| DashError::Parse(format!("bad S@d: {value}")))?;
                    }
                    // Negative repeat ("until next entry") is outside the
                    // consumed subset; clamp it to no repeats.
                    b"r" => repeat = value.parse::<i64>().unwrap_or(0).max(0) as u64,
                    _ => {}
                }
            }
            if duration == 0 {
                return Err(DashError::Parse("S entry with zero duration".into()));
            }
            let start = start.unwrap_or_else(|| timeline.last().map(|e| e.end_ticks()).unwrap_or(0));
            if let Some(last) = timeline.last() {
                if start < last.end_ticks() {
                    return Err(DashError::Parse(
                        "SegmentTimeline entries must be non-decreasing in time".into(),
                    ));
                }
            }
            timeline.push(TimelineEntry {
                start_ticks: start,
                duration_ticks: duration,
                repeat,
            });
        }
        "SegmentBase" => {
            let mut base = SegmentBase::default();
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"indexRange" {
                    base.index_range = parse_byte_range(&attr.unescape_value()?)?;
                }
            }
            state.segment_base = Some(base);
        }
        "Initialization" => {
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"range" {
                    let range = parse_byte_range(&attr.unescape_value()?)?;
                    if let Some(base) = state.segment_base.as_mut() {
                        base.init_range = Some(range);
                    }
                }
            }
        }
        "ContentProtection" => {
            let mut protection = ContentProtection {
                scheme_uuid: String::new(),
                pssh: Vec::new(),
            };
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"schemeIdUri" {
                    let value = attr.unescape_value()?;
                    protection.scheme_uuid = value
                        .strip_prefix("urn:uuid:")
                        .unwrap_or(&value)
                        .to_ascii_lowercase();
                }
            }
            state.protection = Some(protection);
        }
        "pssh" => {
            if state.protection.is_some() {
                state.text_target = TextTarget::Pssh;
            }
        }
        "BaseURL" => {
            state.text_target = if state.period.is_some() {
                TextTarget::PeriodBaseUrl
            } else {
                TextTarget::MpdBaseUrl
            };
        }
        _ => {}
    }
    Ok(())
}

fn close_element(state: &mut ParseState, tag: &str) -> Result<(), DashError> {
    match tag {
        "SegmentTimeline" => {
            if let (Some(template), Some(timeline)) =
                (state.template.as_mut(), state.timeline.take())
            {
                template.timeline = Some(timeline);
            }
        }
        "SegmentTemplate" => {
            let template = state.template.take();
            if let Some(rep) = state.representation.as_mut() {
                rep.template = template;
            } else {
                state.adaptation_template = template;
            }
        }
        "SegmentBase" => {
            let base = state.segment_base.take();
            if let Some(rep) = state.representation.as_mut() {
                rep.segment_base = base;
            }
        }
        "ContentProtection" => {
            if let Some(protection) = state.protection.take() {
                if !protection.scheme_uuid.is_empty() {
                    state.manifest.protections.push(protection);
                }
            }
        }
        "pssh" => state.text_target = TextTarget::None,
        "BaseURL" => state.text_target = TextTarget::None,
        "Representation" => {
            let rep = state
                .representation
                .take()
                .ok_or_else(|| DashError::Parse("unbalanced Representation element".into()))?;
            let set = state
                .adaptation
                .as_mut()
                .ok_or_else(|| DashError::Parse("Representation outside AdaptationSet".into()))?;

            // Inherit the adaptation-level template when the representation
            // declares no addressing of its own.
            let addressing = if let Some(base) = rep.segment_base {
                Addressing::Base(base)
            } else if let Some(template) = rep.template.or_else(|| state.adaptation_template.clone())
            {
                Addressing::Template(template)
            } else {
                return Err(DashError::Unsupported(format!(
                    "representation {} has neither SegmentTemplate nor SegmentBase",
                    rep.id
                )));
            };

            let track = TrackType::infer(&state.adaptation_content_type, &set.mime_type);
            let kind = match track {
                TrackType::Audio => RepresentationKind::Audio {
                    sampling_rate: rep.audio_sampling_rate.or(set.audio_sampling_rate),
                    channels: rep.audio_channels.or(set.audio_channels),
                },
                TrackType::Video => RepresentationKind::Video {
                    width: rep.width.or(set.width),
                    height: rep.height.or(set.height),
                    frame_rate: rep.frame_rate.or(set.frame_rate),
                },
                TrackType::Subtitle => RepresentationKind::Subtitle,
                TrackType::Unknown => RepresentationKind::Unknown,
            };

            set.representations.push(Representation {
                id: rep.id,
                bandwidth: rep.bandwidth,
                kind,
                selected: true,
                addressing,
            });
        }
        "AdaptationSet" => {
            let mut set = state
                .adaptation
                .take()
                .ok_or_else(|| DashError::Parse("unbalanced AdaptationSet element".into()))?;
            set.track_type = TrackType::infer(&state.adaptation_content_type, &set.mime_type);
            state.adaptation_template = None;
            if let Some(period) = state.period.as_mut() {
                period.adaptation_sets.push(set);
            }
        }
        "Period" => {
            let mut period = state
                .period
                .take()
                .ok_or_else(|| DashError::Parse("unbalanced Period element".into()))?;
            period.select_default_adaptations();
            // Periods are ordered by start time; an absent @start continues
            // where the previous period ended.
            if period.start_us == 0 {
                if let Some(prev) = state.manifest.periods.last() {
                    if let Some(end) = prev.end_us() {
                        period.start_us = end;
                    }
                }
            }
            state.manifest.periods.push(period);
        }
        _ => {}
    }
    Ok(())
}

fn handle_text(state: &mut ParseState, text: &str) -> Result<(), DashError> {
    match state.text_target {
        TextTarget::MpdBaseUrl => state.manifest.base_url = Some(text.to_string()),
        TextTarget::PeriodBaseUrl => {
            if let Some(period) = state.period.as_mut() {
                period.base_url = Some(text.to_string());
            }
        }
        TextTarget::Pssh => {
            if let Some(protection) = state.protection.as_mut() {
                protection.pssh = rbase64::decode(text)
                    .map_err(|e| DashError::Parse(format!("bad pssh payload: {e}")))?;
            }
        }
        TextTarget::None => {}
    }
    Ok(())
}

/// Converts an ISO-8601 duration (`PnYnMnDTnHnMnS`, fractional seconds
/// allowed) to microseconds.
pub fn parse_duration_us(value: &str) -> Result<u64, DashError> {
    let duration = iso8601_duration::Duration::parse(value)
        .map_err(|_| DashError::Parse(format!("bad ISO-8601 duration: {value}")))?;
    let std = duration
        .to_std()
        .ok_or_else(|| DashError::Parse(format!("non-convertible duration: {value}")))?;
    Ok(std.as_micros() as u64)
}

/// Frame rates appear either as a plain decimal or as `"num/den"`.
fn parse_frame_rate(value: &str) -> Option<f64> {
    if let Some((num, den)) = value.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        value.parse().ok()
    }
}

/// Parses an inclusive byte range of the form `"first-last"`.
fn parse_byte_range(value: &str) -> Result<(u64, u64), DashError> {
    let (first, last) = value
        .split_once('-')
        .ok_or_else(|| DashError::Parse(format!("bad byte range: {value}")))?;
    let first = first
        .parse()
        .map_err(|_| DashError::Parse(format!("bad byte range: {value}")))?;
    let last = last
        .parse()
        .map_err(|_| DashError::Parse(format!("bad byte range: {value}")))?;
    if last < first {
        return Err(DashError::Parse(format!("inverted byte range: {value}")));
    }
    Ok((first, last))
}
