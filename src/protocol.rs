//! Serial line protocol between the host and the slider device
//!
//! Device to host: one ASCII line per sample, `field(|field)*\r\n`, where the
//! field position is the slider index and each field is either a 1-4 digit
//! percent reading or one of the command characters `=`, `+`, `-`, `^`.
//!
//! Host to device: short messages framed by `<` and `>`:
//! - `<^name0|name1|...>` slider labels
//! - `<!{mute}|{percent}>` master output state
//! - `<#>` keep-alive

pub mod noise;

use std::fmt;

use tracing::{info, trace};

pub use noise::{significantly_different, NoiseReduction};

/// Highest valid reading for the percent-scaled protocol
pub const MAX_READING: u16 = 100;

/// Size of one label buffer on the device, including the terminator
pub const NAME_BUFFER_LEN: usize = 20;

const FRAME_START: char = '<';
const FRAME_END: char = '>';
const FIELD_SEPARATOR: char = '|';

/// Sentinel stored in the value history for "never delivered"
const UNOBSERVED: f32 = -1.0;

/// What a decoded field asks the host to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliderCommand {
    /// Absolute position
    Set,
    /// Encoder step up (`+`)
    Increment,
    /// Encoder step down (`-`)
    Decrement,
    /// Device wants the slider labels (`^`)
    RequestNames,
}

/// One slider event decoded from a device line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderMoveEvent {
    pub slider: usize,
    pub command: SliderCommand,
    /// Scalar in [0, 1]; 0.0 for non-`Set` commands
    pub value: f32,
}

impl SliderMoveEvent {
    pub fn set(slider: usize, value: f32) -> Self {
        Self {
            slider,
            command: SliderCommand::Set,
            value,
        }
    }

    pub fn command(slider: usize, command: SliderCommand) -> Self {
        Self {
            slider,
            command,
            value: 0.0,
        }
    }
}

/// Decoder options taken from config, re-read on every line
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecoderOptions {
    pub invert_sliders: bool,
    pub noise_reduction: NoiseReduction,
}

/// A single syntactically valid field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Reading(u16),
    Placeholder,
    Command(SliderCommand),
}

impl Field {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "=" => Some(Field::Placeholder),
            "+" => Some(Field::Command(SliderCommand::Increment)),
            "-" => Some(Field::Command(SliderCommand::Decrement)),
            "^" => Some(Field::Command(SliderCommand::RequestNames)),
            digits if (1..=4).contains(&digits.len())
                && digits.bytes().all(|b| b.is_ascii_digit()) =>
            {
                digits.parse().ok().map(Field::Reading)
            },
            _ => None,
        }
    }
}

/// Split a raw line into fields, or `None` if it fails the grammar
fn parse_fields(line: &str) -> Option<Vec<Field>> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.is_empty() {
        return None;
    }

    line.split(FIELD_SEPARATOR).map(Field::parse).collect()
}

/// Whether a line matches the device grammar
pub fn is_valid_line(line: &str) -> bool {
    parse_fields(line).is_some()
}

/// Stateful decoder for device lines
///
/// Keeps the last delivered value per slider. A change in the number of
/// fields per line resets the history, so the first line after a reconnect or
/// a slider-count change emits every reading.
#[derive(Debug, Default)]
pub struct LineDecoder {
    slider_count: usize,
    last_values: Vec<f32>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields seen on the last accepted line (0 before any)
    pub fn slider_count(&self) -> usize {
        self.slider_count
    }

    /// Last delivered value for a slider, if one was delivered
    pub fn last_value(&self, slider: usize) -> Option<f32> {
        self.last_values
            .get(slider)
            .copied()
            .filter(|v| *v != UNOBSERVED)
    }

    /// Forget everything; the next line is a first observation
    pub fn reset(&mut self) {
        self.slider_count = 0;
        self.last_values.clear();
    }

    /// Decode one line into zero or more events, in field order
    ///
    /// Invalid lines and lines whose first reading is out of range are
    /// dropped without touching the history.
    pub fn decode(&mut self, line: &str, options: &DecoderOptions) -> Vec<SliderMoveEvent> {
        let Some(fields) = parse_fields(line) else {
            trace!(line = line.trim_end(), "Dropping line that fails the grammar");
            return Vec::new();
        };

        if let Some(Field::Reading(first)) = fields.first() {
            if *first > MAX_READING {
                trace!(line = line.trim_end(), "Dropping line with framing error at index 0");
                return Vec::new();
            }
        }

        self.update_slider_count(fields.len());

        let mut events = Vec::new();
        for (slider, field) in fields.into_iter().enumerate() {
            match field {
                Field::Placeholder => {},
                Field::Command(command) => events.push(SliderMoveEvent::command(slider, command)),
                Field::Reading(reading) => {
                    let value = reading_to_scalar(reading, options.invert_sliders);
                    let last = self.last_values[slider];
                    if significantly_different(last, value, options.noise_reduction) {
                        self.last_values[slider] = value;
                        events.push(SliderMoveEvent::set(slider, value));
                    }
                },
            }
        }

        events
    }

    fn update_slider_count(&mut self, count: usize) {
        if count != self.slider_count {
            info!(amount = count, "Detected sliders");
            self.slider_count = count;
            self.last_values = vec![UNOBSERVED; count];
        }
    }
}

/// Convert a percent reading to a normalized scalar
pub fn reading_to_scalar(reading: u16, invert: bool) -> f32 {
    let scalar = f32::from(reading.min(MAX_READING)) / f32::from(MAX_READING);
    if invert {
        1.0 - scalar
    } else {
        scalar
    }
}

/// Host to device messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Slider labels, one per slider index
    SliderNames(Vec<String>),
    /// Master output mute flag and volume percent (0-100)
    MasterState { muted: bool, volume_percent: u8 },
    /// Heartbeat; the device blanks its display after 10 s without one
    KeepAlive,
}

impl DeviceMessage {
    /// Build a master state message from a volume scalar
    pub fn master_state(volume: f32, muted: bool) -> Self {
        let volume_percent = (volume.clamp(0.0, 1.0) * 100.0).round() as u8;
        DeviceMessage::MasterState {
            muted,
            volume_percent,
        }
    }

    /// Encode to the framed ASCII form written to the serial port
    pub fn encode(&self) -> String {
        let body = match self {
            DeviceMessage::SliderNames(names) => {
                let names: Vec<String> = names.iter().map(|n| fit_name(n)).collect();
                format!("^{}", names.join("|"))
            },
            DeviceMessage::MasterState {
                muted,
                volume_percent,
            } => format!("!{}|{}", u8::from(*muted), (*volume_percent).min(100)),
            DeviceMessage::KeepAlive => "#".to_string(),
        };
        format!("{}{}{}", FRAME_START, body, FRAME_END)
    }

    /// Parse a framed host message (used by the sniffer and tests)
    pub fn parse(framed: &str) -> Option<Self> {
        let body = framed
            .trim()
            .strip_prefix(FRAME_START)?
            .strip_suffix(FRAME_END)?;

        if body == "#" {
            return Some(DeviceMessage::KeepAlive);
        }

        if let Some(names) = body.strip_prefix('^') {
            let names = if names.is_empty() {
                Vec::new()
            } else {
                names.split(FIELD_SEPARATOR).map(str::to_string).collect()
            };
            return Some(DeviceMessage::SliderNames(names));
        }

        let state = body.strip_prefix('!')?;
        let (mute, volume) = state.split_once(FIELD_SEPARATOR)?;
        let muted = match mute {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        let volume_percent: u8 = volume.parse().ok()?;
        if volume_percent > 100 {
            return None;
        }

        Some(DeviceMessage::MasterState {
            muted,
            volume_percent,
        })
    }
}

impl fmt::Display for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Make a label safe for the device: no framing characters, and no longer
/// than the label buffer minus its terminator (cut on a char boundary)
fn fit_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '|' | '<' | '>' => '_',
            c => c,
        })
        .collect();

    let budget = NAME_BUFFER_LEN - 1;
    if cleaned.len() <= budget {
        return cleaned;
    }

    let mut end = budget;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn opts() -> DecoderOptions {
        DecoderOptions::default()
    }

    #[test]
    fn test_decode_first_line_emits_everything() {
        let mut decoder = LineDecoder::new();
        let events = decoder.decode("45|78|12\r\n", &opts());

        assert_eq!(
            events,
            vec![
                SliderMoveEvent::set(0, 0.45),
                SliderMoveEvent::set(1, 0.78),
                SliderMoveEvent::set(2, 0.12),
            ]
        );
        assert_eq!(decoder.slider_count(), 3);
    }

    #[test]
    fn test_decode_same_line_twice_is_quiet() {
        let mut decoder = LineDecoder::new();
        decoder.decode("45|78|12\r\n", &opts());
        assert!(decoder.decode("45|78|12\r\n", &opts()).is_empty());
    }

    #[test]
    fn test_noise_is_suppressed_against_delivered_value() {
        let mut decoder = LineDecoder::new();
        decoder.decode("50\r\n", &opts());

        // 0.51 and 0.52 sit within the default threshold of 0.025 from 0.50
        assert!(decoder.decode("51\r\n", &opts()).is_empty());
        assert!(decoder.decode("52\r\n", &opts()).is_empty());

        let events = decoder.decode("60\r\n", &opts());
        assert_eq!(events, vec![SliderMoveEvent::set(0, 0.60)]);
        assert_eq!(decoder.last_value(0), Some(0.60));
    }

    #[test]
    fn test_drift_does_not_accumulate() {
        let mut decoder = LineDecoder::new();
        decoder.decode("50\r\n", &opts());
        for reading in ["51", "52", "51", "52"] {
            assert!(decoder.decode(&format!("{}\r\n", reading), &opts()).is_empty());
        }
        // still compared against 0.50, not against the previous raw 0.52
        assert_eq!(decoder.last_value(0), Some(0.50));
    }

    #[test]
    fn test_commands_and_placeholder() {
        let mut decoder = LineDecoder::new();
        let events = decoder.decode("+|45|=|^|-\r\n", &opts());

        assert_eq!(
            events,
            vec![
                SliderMoveEvent::command(0, SliderCommand::Increment),
                SliderMoveEvent::set(1, 0.45),
                SliderMoveEvent::command(3, SliderCommand::RequestNames),
                SliderMoveEvent::command(4, SliderCommand::Decrement),
            ]
        );
    }

    #[test]
    fn test_commands_are_never_deduplicated() {
        let mut decoder = LineDecoder::new();
        decoder.decode("+|45\r\n", &opts());
        let events = decoder.decode("+|45\r\n", &opts());
        assert_eq!(events, vec![SliderMoveEvent::command(0, SliderCommand::Increment)]);
    }

    #[test]
    fn test_framing_error_at_index_zero() {
        let mut decoder = LineDecoder::new();
        decoder.decode("10|20\r\n", &opts());

        assert!(decoder.decode("101|90\r\n", &opts()).is_empty());
        assert_eq!(decoder.last_value(1), Some(0.20));
        assert_eq!(decoder.slider_count(), 2);
    }

    #[test]
    fn test_out_of_range_reading_after_index_zero_is_clamped() {
        let mut decoder = LineDecoder::new();
        let events = decoder.decode("10|4000\r\n", &opts());
        assert_eq!(events[1], SliderMoveEvent::set(1, 1.0));
    }

    #[test]
    fn test_malformed_lines() {
        let mut decoder = LineDecoder::new();
        for line in ["", "\r\n", "12||4\r\n", "12345\r\n", "ab|12\r\n", "++\r\n", "|\r\n", "12|\r\n"] {
            assert!(decoder.decode(line, &opts()).is_empty(), "line {:?}", line);
        }
        assert_eq!(decoder.slider_count(), 0);
    }

    #[test]
    fn test_slider_count_change_resynchronizes() {
        let mut decoder = LineDecoder::new();
        decoder.decode("10|20\r\n", &opts());
        let events = decoder.decode("10|20|30\r\n", &opts());
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_reset_forces_first_observation() {
        let mut decoder = LineDecoder::new();
        decoder.decode("10|20\r\n", &opts());
        decoder.reset();
        assert_eq!(decoder.decode("10|20\r\n", &opts()).len(), 2);
    }

    #[test]
    fn test_invert_sliders() {
        let mut decoder = LineDecoder::new();
        let options = DecoderOptions {
            invert_sliders: true,
            ..Default::default()
        };
        let events = decoder.decode("0|100|25\r\n", &options);
        assert_eq!(events[0].value, 1.0);
        assert_eq!(events[1].value, 0.0);
        assert!((events[2].value - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_encode_messages() {
        assert_eq!(DeviceMessage::KeepAlive.encode(), "<#>");
        assert_eq!(DeviceMessage::master_state(0.42, true).encode(), "<!1|42>");
        assert_eq!(DeviceMessage::master_state(1.0, false).encode(), "<!0|100>");
        assert_eq!(
            DeviceMessage::SliderNames(vec!["Master".into(), "Chrome".into()]).encode(),
            "<^Master|Chrome>"
        );
    }

    #[test]
    fn test_names_are_truncated_to_buffer() {
        let long = "A very long application label";
        let encoded = DeviceMessage::SliderNames(vec![long.into()]).encode();
        assert_eq!(encoded, format!("<^{}>", &long[..NAME_BUFFER_LEN - 1]));

        // multi-byte characters are not split
        let accented = "ééééééééééé"; // 22 bytes
        let encoded = DeviceMessage::SliderNames(vec![accented.into()]).encode();
        let DeviceMessage::SliderNames(names) = DeviceMessage::parse(&encoded).unwrap() else {
            panic!("expected names");
        };
        assert_eq!(names[0], "ééééééééé");
    }

    #[test]
    fn test_names_round_trip() {
        let names = vec![
            "Master".to_string(),
            "Discord".to_string(),
            "Games and stuff".to_string(),
            "Spotify music app".to_string(),
        ];
        let encoded = DeviceMessage::SliderNames(names.clone()).encode();
        assert_eq!(
            DeviceMessage::parse(&encoded),
            Some(DeviceMessage::SliderNames(names))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(DeviceMessage::parse("#"), None);
        assert_eq!(DeviceMessage::parse("<!2|50>"), None);
        assert_eq!(DeviceMessage::parse("<!1|150>"), None);
        assert_eq!(DeviceMessage::parse("<?>"), None);
    }

    proptest! {
        #[test]
        fn prop_redecode_is_idempotent(readings in proptest::collection::vec(0u16..=100, 1..8)) {
            let line = format!(
                "{}\r\n",
                readings.iter().map(u16::to_string).collect::<Vec<_>>().join("|")
            );
            let mut decoder = LineDecoder::new();
            let first = decoder.decode(&line, &opts());
            prop_assert_eq!(first.len(), readings.len());
            prop_assert!(decoder.decode(&line, &opts()).is_empty());
        }

        #[test]
        fn prop_invalid_lines_do_not_touch_history(
            readings in proptest::collection::vec(0u16..=100, 1..6),
            junk in "[a-z ]{1,6}",
        ) {
            let valid = format!(
                "{}\r\n",
                readings.iter().map(u16::to_string).collect::<Vec<_>>().join("|")
            );
            let mut decoder = LineDecoder::new();
            decoder.decode(&valid, &opts());
            let before: Vec<_> = (0..readings.len()).map(|i| decoder.last_value(i)).collect();

            let invalid = format!("{}|{}\r\n", readings[0], junk);
            prop_assert!(decoder.decode(&invalid, &opts()).is_empty());

            let after: Vec<_> = (0..readings.len()).map(|i| decoder.last_value(i)).collect();
            prop_assert_eq!(before, after);
            prop_assert_eq!(decoder.slider_count(), readings.len());
        }

        #[test]
        fn prop_framing_error_yields_nothing(first in 101u16..=9999, rest in 0u16..=100) {
            let mut decoder = LineDecoder::new();
            let line = format!("{}|{}\r\n", first, rest);
            prop_assert!(decoder.decode(&line, &opts()).is_empty());
            prop_assert_eq!(decoder.slider_count(), 0);
        }
    }
}
