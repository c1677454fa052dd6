//! Wire constants shared by the codec, the subchannel command dispatch and the main channel.

/// Four bytes sent by the helper immediately after connecting to the main channel.
pub const GREETING: [u8; 4] = [0x41, 0x53, 0x4D, 0x43];

/// Upper bound on a single request body, in bytes.
pub const MAX_MESSAGE_LENGTH: u32 = 2 * 1024 * 1024;

/// Upper bound on the element count of a string array.
pub const MAX_STRING_ARRAY_COUNT: u32 = 64 * 1024;

/// Size of one [`crate::write_buffer::WriteBuffer`] block.
pub const WRITE_BUFFER_BLOCK_LEN: usize = 32 * 1024;

/// Maximum number of file descriptors accepted in a single `recvmsg` control buffer.
pub const MAX_FDS_PER_CALL: usize = 3;

/// Subchannel request command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    SpawnProcess = 1,
    SendSignal = 2,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::SpawnProcess),
            2 => Some(Self::SendSignal),
            _ => None,
        }
    }
}

/// Flags carried in the body of a `SpawnProcess` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnFlags(u32);

impl SpawnFlags {
    pub const REDIRECT_STDIN: u32 = 1;
    pub const REDIRECT_STDOUT: u32 = 2;
    pub const REDIRECT_STDERR: u32 = 4;
    pub const CREATE_NEW_PROCESS_GROUP: u32 = 8;
    pub const ENABLE_AUTO_TERMINATION: u32 = 16;

    const KNOWN_BITS: u32 = Self::REDIRECT_STDIN
        | Self::REDIRECT_STDOUT
        | Self::REDIRECT_STDERR
        | Self::CREATE_NEW_PROCESS_GROUP
        | Self::ENABLE_AUTO_TERMINATION;

    pub fn from_bits(raw: u32) -> Option<Self> {
        if raw & !Self::KNOWN_BITS == 0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Abstract signal values accepted by `SendSignal`, decoupled from raw signal numbers so the
/// wire protocol stays the same across platforms with different signal numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AbstractSignal {
    Interrupt = 1,
    Kill = 2,
    Termination = 3,
}

impl AbstractSignal {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Interrupt),
            2 => Some(Self::Kill),
            3 => Some(Self::Termination),
            _ => None,
        }
    }

    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Kill => Signal::SIGKILL,
            Self::Termination => Signal::SIGTERM,
        }
    }

    /// Whether a `SIGCONT` follow-up should be sent after this signal, to wake stopped processes.
    pub fn also_send_cont(self) -> bool {
        matches!(self, Self::Termination)
    }
}

/// A byte pushed through the notification pipe to wake the [`crate::service::Service`] main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Notification {
    Quit = 1,
    ReapRequest = 2,
    SubchannelClosed = 3,
}

impl Notification {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Quit),
            2 => Some(Self::ReapRequest),
            3 => Some(Self::SubchannelClosed),
            _ => None,
        }
    }
}
