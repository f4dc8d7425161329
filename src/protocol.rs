//! Wireless frame codec.
//!
//! Every packet on the link carries a 4-byte header followed by up to
//! `length` bytes of data and an optional 2-byte checksum:
//!
//! - Byte 0: frame type, package type in bits 0-1 and sub type in bits 2-7
//! - Byte 1: frame control flags (encrypted, checksum, direction, ack, fragment)
//! - Byte 2: sequence number, modulo 256
//! - Byte 3: data length
//!
//! Logical messages longer than one package are split into fragments. Each
//! fragment except the last sets the fragment flag and prefixes its data with
//! a little-endian count of the bytes remaining, the fragment's own included.

use bytes::{BufMut, Bytes, BytesMut};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use crate::error::{MowerError, Result};

/// Header bytes preceding the data of every frame
pub const PACKAGE_HEADER_LENGTH: usize = 4;

/// Smallest package length the link negotiates
pub const MIN_PACKAGE_LENGTH: usize = 20;

/// Data sub type carrying application messages
pub const SUBTYPE_CUSTOM_DATA: u8 = 19;

/// Control sub type for acknowledgements
pub const SUBTYPE_ACK: u8 = 0;

const FRAGMENT_PREFIX_LENGTH: usize = 2;
const CHECKSUM_LENGTH: usize = 2;
const MAX_SUBTYPE: u8 = 0x3F;

/// Package type, the low two bits of the frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    /// Link control packets
    Ctrl,
    /// Data packets
    Data,
    /// Reserved values
    Reserved(u8),
}

impl PackageType {
    /// Extract the package type from a frame type byte
    #[must_use]
    pub const fn from_type_byte(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Ctrl,
            1 => Self::Data,
            other => Self::Reserved(other),
        }
    }

    /// Two-bit wire value
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Ctrl => 0,
            Self::Data => 1,
            Self::Reserved(value) => value & 0x03,
        }
    }
}

/// Pack a package type and sub type into a frame type byte
#[must_use]
pub const fn type_byte(package_type: PackageType, sub_type: u8) -> u8 {
    ((sub_type & MAX_SUBTYPE) << 2) | package_type.bits()
}

/// Which side of the link produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written by the app
    AppToDevice,
    /// Notified by the device
    DeviceToApp,
}

/// Frame control flags
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameControl(u8);

impl FrameControl {
    /// Data is encrypted
    pub const ENCRYPTED: u8 = 0x01;
    /// A 2-byte checksum trails the data
    pub const CHECKSUM: u8 = 0x02;
    /// Set for device-to-app frames
    pub const DIRECTION: u8 = 0x04;
    /// Sender expects an acknowledgement
    pub const REQUIRE_ACK: u8 = 0x08;
    /// More fragments follow
    pub const FRAGMENT: u8 = 0x10;

    /// Wrap a raw flag byte
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag byte
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Set or clear a flag
    #[must_use]
    pub const fn with(self, flag: u8, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }

    /// Data is encrypted
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Data is followed by a checksum
    #[must_use]
    pub const fn is_checksummed(self) -> bool {
        self.0 & Self::CHECKSUM != 0
    }

    /// Sender expects an acknowledgement
    #[must_use]
    pub const fn requires_ack(self) -> bool {
        self.0 & Self::REQUIRE_ACK != 0
    }

    /// More fragments follow this one
    #[must_use]
    pub const fn has_fragment(self) -> bool {
        self.0 & Self::FRAGMENT != 0
    }

    /// Direction of the frame
    #[must_use]
    pub const fn direction(self) -> Direction {
        if self.0 & Self::DIRECTION == 0 {
            Direction::AppToDevice
        } else {
            Direction::DeviceToApp
        }
    }
}

impl fmt::Debug for FrameControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameControl")
            .field("encrypted", &self.is_encrypted())
            .field("checksum", &self.is_checksummed())
            .field("direction", &self.direction())
            .field("require_ack", &self.requires_ack())
            .field("fragment", &self.has_fragment())
            .finish()
    }
}

/// One wireless packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Package type
    pub package_type: PackageType,
    /// Sub type, six bits
    pub sub_type: u8,
    /// Control flags
    pub control: FrameControl,
    /// Sequence number
    pub sequence: u8,
    /// Data as carried on the wire, fragment prefix included
    pub payload: Bytes,
    /// Trailing checksum, when flagged and present
    pub checksum: Option<[u8; 2]>,
}

impl Frame {
    /// Serialize the frame to wire bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let checksum_len = self.checksum.map_or(0, |_| CHECKSUM_LENGTH);
        let mut buf =
            BytesMut::with_capacity(PACKAGE_HEADER_LENGTH + self.payload.len() + checksum_len);

        buf.put_u8(type_byte(self.package_type, self.sub_type));
        buf.put_u8(self.control.bits());
        buf.put_u8(self.sequence);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
        if let Some(checksum) = self.checksum {
            buf.extend_from_slice(&checksum);
        }

        buf.freeze()
    }

    /// Remaining-byte count carried by a fragment
    ///
    /// Only meaningful for unencrypted frames.
    #[must_use]
    pub fn fragment_remaining(&self) -> Option<u16> {
        if self.control.has_fragment() && self.payload.len() >= FRAGMENT_PREFIX_LENGTH {
            Some(u16::from_le_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }

    /// Data with any fragment prefix removed
    ///
    /// Only meaningful for unencrypted frames.
    #[must_use]
    pub fn data(&self) -> Bytes {
        if self.control.has_fragment() {
            self.payload.slice(FRAGMENT_PREFIX_LENGTH.min(self.payload.len())..)
        } else {
            self.payload.clone()
        }
    }
}

/// Whether a decoded frame finishes its logical message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Last (or only) frame of a logical message
    Complete,
    /// More fragments follow
    Continued,
}

/// Decode one frame from raw notification bytes
///
/// # Errors
///
/// Returns [`MowerError::MalformedFrame`] if fewer than 4 header bytes are
/// present, if the declared length exceeds the available bytes, or if a
/// fragment is too short to carry its remaining-byte count.
pub fn decode(bytes: &[u8]) -> Result<(Frame, FrameStatus)> {
    if bytes.len() < PACKAGE_HEADER_LENGTH {
        return Err(MowerError::MalformedFrame(format!(
            "{} bytes, need at least {PACKAGE_HEADER_LENGTH} header bytes",
            bytes.len()
        )));
    }

    let kind = bytes[0];
    let control = FrameControl::from_bits(bytes[1]);
    let sequence = bytes[2];
    let length = usize::from(bytes[3]);

    let end = PACKAGE_HEADER_LENGTH + length;
    if end > bytes.len() {
        return Err(MowerError::MalformedFrame(format!(
            "declared length {length} exceeds {} available bytes",
            bytes.len() - PACKAGE_HEADER_LENGTH
        )));
    }

    if control.has_fragment() && length < FRAGMENT_PREFIX_LENGTH {
        return Err(MowerError::MalformedFrame(format!(
            "fragment of {length} bytes has no remaining-byte count"
        )));
    }

    let checksum = if control.is_checksummed() && bytes.len() >= end + CHECKSUM_LENGTH {
        Some([bytes[end], bytes[end + 1]])
    } else {
        None
    };

    let frame = Frame {
        package_type: PackageType::from_type_byte(kind),
        sub_type: kind >> 2,
        control,
        sequence,
        payload: Bytes::copy_from_slice(&bytes[PACKAGE_HEADER_LENGTH..end]),
        checksum,
    };

    let status = if control.has_fragment() {
        FrameStatus::Continued
    } else {
        FrameStatus::Complete
    };

    Ok((frame, status))
}

/// Monotonic send sequence shared by all traffic on a connection
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU8);

impl SequenceCounter {
    /// Create a counter starting at zero
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Take the next sequence number, wrapping at 256
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Restart from zero
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Diagnostic raised when a received sequence number skips
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Sequence number the receiver expected
    pub expected: u8,
    /// Sequence number actually received
    pub observed: u8,
}

impl fmt::Display for SequenceGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, observed {}", self.expected, self.observed)
    }
}

/// Tracks the expected read sequence and resynchronizes on mismatch
#[derive(Debug, Default)]
pub struct SequenceTracker {
    expected: u8,
}

impl SequenceTracker {
    /// Create a tracker expecting sequence zero
    #[must_use]
    pub const fn new() -> Self {
        Self { expected: 0 }
    }

    /// Next sequence number the tracker expects
    #[must_use]
    pub const fn expected(&self) -> u8 {
        self.expected
    }

    /// Record a received sequence number
    ///
    /// On mismatch the tracker adopts the observed number and reports a gap.
    pub fn observe(&mut self, sequence: u8) -> Option<SequenceGap> {
        let gap = (sequence != self.expected).then_some(SequenceGap {
            expected: self.expected,
            observed: sequence,
        });
        self.expected = sequence.wrapping_add(1);
        gap
    }
}

/// Optional checksum and encryption capability
///
/// Without one, flagged frames are accepted unvalidated on receive and
/// cannot be produced on send.
pub trait FrameSecurity: Send + Sync {
    /// Encrypt outgoing data
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be encrypted.
    fn encrypt(&self, sequence: u8, data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt incoming data
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be decrypted.
    fn decrypt(&self, sequence: u8, data: &[u8]) -> Result<Vec<u8>>;

    /// Compute the checksum over plaintext data
    fn checksum(&self, sequence: u8, data: &[u8]) -> [u8; 2];
}

/// Per-message frame options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Package type
    pub package_type: PackageType,
    /// Sub type
    pub sub_type: u8,
    /// Encrypt the data
    pub encrypted: bool,
    /// Append a checksum
    pub checksum: bool,
    /// Ask the receiver to acknowledge
    pub require_ack: bool,
    /// Direction flag to set
    pub direction: Direction,
}

impl EncodeOptions {
    /// Application message written by the app
    #[must_use]
    pub const fn custom_data() -> Self {
        Self {
            package_type: PackageType::Data,
            sub_type: SUBTYPE_CUSTOM_DATA,
            encrypted: false,
            checksum: false,
            require_ack: false,
            direction: Direction::AppToDevice,
        }
    }

    /// Same options with a different direction
    #[must_use]
    pub const fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self::custom_data()
    }
}

/// Splits payloads into sequenced frames
pub struct FrameEncoder {
    package_length: usize,
    sequence: Arc<SequenceCounter>,
    security: Option<Arc<dyn FrameSecurity>>,
}

impl FrameEncoder {
    /// Create an encoder drawing sequence numbers from `sequence`
    ///
    /// Package lengths below [`MIN_PACKAGE_LENGTH`] are raised to it.
    #[must_use]
    pub fn new(package_length: usize, sequence: Arc<SequenceCounter>) -> Self {
        Self {
            package_length: package_length.max(MIN_PACKAGE_LENGTH),
            sequence,
            security: None,
        }
    }

    /// Attach a checksum/encryption capability
    #[must_use]
    pub fn with_security(mut self, security: Arc<dyn FrameSecurity>) -> Self {
        self.security = Some(security);
        self
    }

    /// Effective package length limit
    #[must_use]
    pub const fn package_length(&self) -> usize {
        self.package_length
    }

    /// Shared sequence counter
    #[must_use]
    pub fn sequence(&self) -> &Arc<SequenceCounter> {
        &self.sequence
    }

    /// Largest data field a single frame may carry
    #[must_use]
    pub fn data_limit(&self, options: &EncodeOptions) -> usize {
        let checksum = if options.checksum { CHECKSUM_LENGTH } else { 0 };
        (self.package_length - PACKAGE_HEADER_LENGTH - checksum).min(usize::from(u8::MAX))
    }

    /// Encode a payload into one or more wire frames
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::InvalidParameters`] if the payload exceeds
    /// 65535 bytes or if encryption/checksum is requested without a
    /// [`FrameSecurity`] capability.
    pub fn encode(&self, payload: &[u8], options: &EncodeOptions) -> Result<Vec<Bytes>> {
        if payload.len() > usize::from(u16::MAX) {
            return Err(MowerError::InvalidParameters(format!(
                "payload of {} bytes exceeds the fragment counter range",
                payload.len()
            )));
        }
        if (options.encrypted || options.checksum) && self.security.is_none() {
            return Err(MowerError::InvalidParameters(
                "frame security requested but no capability configured".to_string(),
            ));
        }

        let limit = self.data_limit(options);
        let chunk = limit - FRAGMENT_PREFIX_LENGTH;
        let mut frames = Vec::with_capacity(payload.len() / chunk + 1);
        let mut rest = payload;

        while rest.len() > limit {
            let remaining = u16::try_from(rest.len())
                .map_err(|_| MowerError::InvalidParameters("payload too large".to_string()))?;
            let mut data = Vec::with_capacity(limit);
            data.extend_from_slice(&remaining.to_le_bytes());
            data.extend_from_slice(&rest[..chunk]);
            frames.push(self.seal(options, true, data)?);
            rest = &rest[chunk..];
        }
        frames.push(self.seal(options, false, rest.to_vec())?);

        Ok(frames)
    }

    fn seal(&self, options: &EncodeOptions, fragment: bool, data: Vec<u8>) -> Result<Bytes> {
        let sequence = self.sequence.next();
        let control = FrameControl::default()
            .with(FrameControl::ENCRYPTED, options.encrypted)
            .with(FrameControl::CHECKSUM, options.checksum)
            .with(
                FrameControl::DIRECTION,
                options.direction == Direction::DeviceToApp,
            )
            .with(FrameControl::REQUIRE_ACK, options.require_ack)
            .with(FrameControl::FRAGMENT, fragment);

        let (checksum, payload) = match &self.security {
            Some(security) => {
                let checksum = options
                    .checksum
                    .then(|| security.checksum(sequence, &data));
                let payload = if options.encrypted {
                    security.encrypt(sequence, &data)?
                } else {
                    data
                };
                (checksum, payload)
            }
            None => (None, data),
        };

        Ok(Frame {
            package_type: options.package_type,
            sub_type: options.sub_type,
            control,
            sequence,
            payload: Bytes::from(payload),
            checksum,
        }
        .to_bytes())
    }
}

/// A reassembled payload spanning one or more frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Package type of the frames
    pub package_type: PackageType,
    /// Sub type of the frames
    pub sub_type: u8,
    /// Concatenated data, fragment prefixes removed
    pub data: Bytes,
}

impl LogicalMessage {
    /// Whether this message carries an application payload
    #[must_use]
    pub fn is_custom_data(&self) -> bool {
        self.package_type == PackageType::Data && self.sub_type == SUBTYPE_CUSTOM_DATA
    }
}

/// Result of feeding one frame to the accumulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// The message continues in later frames
    Continued,
    /// The message is complete
    Complete(LogicalMessage),
}

/// Outcome of [`NotificationAccumulator::push`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pushed {
    /// Assembly progress
    pub assembly: Assembly,
    /// Sequence gap detected on this frame, if any
    pub gap: Option<SequenceGap>,
}

/// Reassembles notification frames into logical messages
pub struct NotificationAccumulator {
    current: Option<(PackageType, u8)>,
    buffer: BytesMut,
    tracker: SequenceTracker,
    security: Option<Arc<dyn FrameSecurity>>,
}

impl NotificationAccumulator {
    /// Create an empty accumulator
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: None,
            buffer: BytesMut::new(),
            tracker: SequenceTracker::new(),
            security: None,
        }
    }

    /// Attach a checksum/encryption capability
    #[must_use]
    pub fn with_security(mut self, security: Arc<dyn FrameSecurity>) -> Self {
        self.security = Some(security);
        self
    }

    /// Bytes buffered for the in-progress message
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next read sequence number expected
    #[must_use]
    pub const fn expected_sequence(&self) -> u8 {
        self.tracker.expected()
    }

    /// Discard any partial message and restart sequence tracking
    pub fn reset(&mut self) {
        self.current = None;
        self.buffer.clear();
        self.tracker = SequenceTracker::new();
    }

    /// Feed one raw notification
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::MalformedFrame`] if the frame cannot be decoded
    /// or fails validation. The frame is dropped and any partial message is
    /// kept.
    pub fn push(&mut self, raw: &[u8]) -> Result<Pushed> {
        let (frame, status) = decode(raw)?;
        let gap = self.tracker.observe(frame.sequence);
        let data = self.unseal(&frame)?;

        let kind = (frame.package_type, frame.sub_type);
        if !self.buffer.is_empty() && self.current != Some(kind) {
            warn!(
                "Dropping {} bytes of partial message, frame type changed mid-message",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.current = Some(kind);

        let offset = if frame.control.has_fragment() {
            FRAGMENT_PREFIX_LENGTH
        } else {
            0
        };
        self.buffer.extend_from_slice(&data[offset..]);

        let assembly = match status {
            FrameStatus::Continued => Assembly::Continued,
            FrameStatus::Complete => {
                self.current = None;
                Assembly::Complete(LogicalMessage {
                    package_type: frame.package_type,
                    sub_type: frame.sub_type,
                    data: self.buffer.split().freeze(),
                })
            }
        };

        Ok(Pushed { assembly, gap })
    }

    fn unseal(&self, frame: &Frame) -> Result<Bytes> {
        let mut data = frame.payload.clone();

        if frame.control.is_encrypted() {
            match &self.security {
                Some(security) => {
                    data = Bytes::from(security.decrypt(frame.sequence, &data)?);
                }
                None => debug!(
                    "Accepting encrypted frame {} without decryption capability",
                    frame.sequence
                ),
            }
        }

        if frame.control.is_checksummed() {
            match (&self.security, frame.checksum) {
                (Some(security), Some(received)) => {
                    let computed = security.checksum(frame.sequence, &data);
                    if computed != received {
                        return Err(MowerError::MalformedFrame(format!(
                            "checksum mismatch on frame {}: computed {computed:02X?}, received {received:02X?}",
                            frame.sequence
                        )));
                    }
                }
                (Some(_), None) => {
                    return Err(MowerError::MalformedFrame(format!(
                        "frame {} flags a checksum but carries none",
                        frame.sequence
                    )));
                }
                (None, _) => debug!(
                    "Accepting checksummed frame {} without validation",
                    frame.sequence
                ),
            }
        }

        if frame.control.has_fragment() && data.len() < FRAGMENT_PREFIX_LENGTH {
            return Err(MowerError::MalformedFrame(
                "fragment lost its remaining-byte count".to_string(),
            ));
        }

        Ok(data)
    }
}

impl Default for NotificationAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
