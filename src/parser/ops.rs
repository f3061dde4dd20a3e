//! The operations the parser emits. These are pure data: the screen-write
//! layer decides what each one does to a grid.

/// Argument to the erase operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    ToEnd,
    FromStart,
    All,
    Scrollback,
}

impl EraseMode {
    pub fn from_param(p: u32) -> Option<Self> {
        match p {
            0 => Some(EraseMode::ToEnd),
            1 => Some(EraseMode::FromStart),
            2 => Some(EraseMode::All),
            3 => Some(EraseMode::Scrollback),
            _ => None,
        }
    }
}

/// Character-set selectors reachable through SCS sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Ascii,
    Uk,
    DecGraphics,
    DecTechnical,
    /// An ISO-2022 96-character set, identified by its final byte.
    Iso96(u8),
}

/// A CSI parameter: one value plus any colon-separated sub-parameters.
/// `None` marks an omitted position.
pub type Param = Vec<Option<u32>>;

/// One terminal operation decoded from the pty byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermOp {
    Print(char),

    // C0 controls.
    Bell,
    Backspace,
    Tab,
    LineFeed,
    CarriageReturn,
    Enquiry,
    ShiftIn,
    ShiftOut,

    // Cursor motion.
    CursorUp(u16),
    CursorDown(u16),
    CursorForward(u16),
    CursorBackward(u16),
    CursorNextLine(u16),
    CursorPreviousLine(u16),
    CursorHorizontalAbsolute(u16),
    CursorVerticalAbsolute(u16),
    CursorPosition { row: u16, col: u16 },
    HorizontalTab(u16),
    BackTab(u16),
    Index,
    ReverseIndex,
    NextLine,

    // Erase.
    EraseLine(EraseMode),
    EraseDisplay(EraseMode),
    EraseCharacter(u16),

    // Edit.
    InsertLine(u16),
    DeleteLine(u16),
    InsertCharacter(u16),
    DeleteCharacter(u16),
    ScrollUp(u16),
    ScrollDown(u16),
    SetScrollRegion { upper: u16, lower: u16 },

    // Attributes. Raw parameter list, sub-parameters included.
    SelectGraphicRendition(Vec<Param>),

    // Modes, one event per code.
    SetMode(u16),
    ResetMode(u16),
    DecPrivateSet(u16),
    DecPrivateReset(u16),
    RequestMode(u16),
    RequestPrivateMode(u16),

    // Strings. Truncated is set when the payload hit the length cap.
    OperatingSystemCommand { payload: Vec<u8>, truncated: bool },
    DeviceControlString { payload: Vec<u8>, truncated: bool },
    ApplicationProgramCommand { payload: Vec<u8>, truncated: bool },
    PrivacyMessage { payload: Vec<u8>, truncated: bool },
    StartOfString { payload: Vec<u8>, truncated: bool },

    // Sixel graphics, from DCS ... q.
    Sixel { payload: Vec<u8>, background: u16, truncated: bool },

    // Character sets.
    DesignateCharset { slot: u8, charset: Charset },
    LockingShift(u8),
    SingleShift(u8),
    SelectUtf8(bool),

    // Requests answered upstream.
    DeviceAttributes(u16),
    SecondaryDeviceAttributes(u16),
    DeviceStatusReport(u16),

    // Miscellaneous.
    SaveCursor,
    RestoreCursor,
    TabSet,
    TabClear(u16),
    KeypadApplication(bool),
    AlignmentTest,
    FullReset,
}
