use std::fmt;

/// How the bytes following an opcode are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameShape {
    /// Opcode only (yield, quit, exit).
    Bare,
    /// Opcode followed by a 2-byte big-endian channel id.
    Channel,
    /// Opcode, 2-byte big-endian length, then `length` payload bytes.
    Length,
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $byte:literal,)*) => {
        /// HMUX opcode table. Each byte value is the ASCII character shown.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name = $byte,)*
        }

        impl Opcode {
            /// Looks up the opcode for a wire byte, `None` if it is not in the table.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Channel = b'C',
    Ack = b'A',
    Error = b'E',
    Yield = b'Y',
    Quit = b'Q',
    Exit = b'X',
    Data = b'D',
    Uri = b'U',
    String = b'S',
    Header = b'H',
    Binary = b'B',
    Protocol = b'P',
    MetaHeader = b'M',
    Flush = b'f',
    Method = b'm',
    Status = b's',
    ServerName = b'v',
    SendHeader = b'G',
    Null = b'?',
    PathInfo = b'b',
    HttpProtocol = b'c',
    RemoteUser = b'd',
    QueryString = b'e',
    ServerPort = b'g',
    RemoteHost = b'h',
    RemoteAddr = b'i',
    RemotePort = b'j',
    RealPath = b'k',
    ScriptFilename = b'l',
    AuthType = b'n',
    CseUri = b'o',
    ContentLength = b'p',
    ContentType = b'q',
    IsSecure = b'r',
    ClientCert = b't',
    ServerType = b'u',
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn shape(self) -> FrameShape {
        match self {
            Opcode::Yield | Opcode::Quit | Opcode::Exit => FrameShape::Bare,
            Opcode::Channel => FrameShape::Channel,
            _ => FrameShape::Length,
        }
    }

    /// Channel-level control codes.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::Channel
                | Opcode::Ack
                | Opcode::Error
                | Opcode::Yield
                | Opcode::Quit
                | Opcode::Exit
                | Opcode::Flush
        )
    }

    /// Quit and exit both end a channel session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Opcode::Quit | Opcode::Exit)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8() as char)
    }
}
