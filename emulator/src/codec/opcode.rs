//! The opcode table.
//!
//! Every defined operation code is a variant of [`Opcode`], carrying its
//! mnemonic (through `Display`), its [`OperandClass`] and whether it is
//! restricted to master mode. Codes missing from the table are nonexistent
//! instructions.

use parse_display::Display;

/// How an instruction forms and uses its effective address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandClass {
    /// A 20-bit signed value in bits 12–31; no effective address
    Immediate,

    /// Byte operand, the index counts bytes
    Byte,

    /// Halfword operand, the index counts halfwords
    Halfword,

    /// Word operand
    Word,

    /// Doubleword operand, the index counts doublewords
    Doubleword,

    /// The effective word address is used as a value (shift counts, device addresses)
    Address,

    /// The effective word address is a branch target
    Branch,

    /// A 20-bit signed byte displacement; registers R and R|1 describe the strings
    ByteString,

    /// No effective address, the X field carries a function code
    Control,
}

impl OperandClass {
    /// Multiplier applied to the index register, in bytes
    #[must_use]
    pub const fn scale(self) -> u32 {
        match self {
            Self::Byte | Self::ByteString => 1,
            Self::Halfword => 2,
            Self::Doubleword => 8,
            _ => 4,
        }
    }

    /// Whether bits 15–31 hold an (indexable, indirectable) reference address
    #[must_use]
    pub const fn has_reference(self) -> bool {
        !matches!(self, Self::Immediate | Self::ByteString | Self::Control)
    }
}

macro_rules! opcodes {
    (@privileged privileged) => { true };
    (@privileged) => { false };

    ($(
        $(#[doc = $doc:literal])*
        $name:ident = $code:literal, $class:ident $(, $privileged:ident)?;
    )*) => {
        /// A defined operation code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
        #[display(style = "UPPERCASE")]
        pub enum Opcode {
            $(
                $(#[doc = $doc])*
                $name,
            )*
        }

        impl Opcode {
            /// Every defined opcode, in code order
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            /// Look up a 7-bit operation code
            #[must_use]
            pub const fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// The 7-bit operation code
            #[must_use]
            pub const fn code(self) -> u8 {
                match self {
                    $(Self::$name => $code,)*
                }
            }

            /// How the effective address is formed
            #[must_use]
            pub const fn class(self) -> OperandClass {
                match self {
                    $(Self::$name => OperandClass::$class,)*
                }
            }

            /// Whether executing it in slave mode is a privilege violation
            #[must_use]
            pub const fn is_privileged(self) -> bool {
                match self {
                    $(Self::$name => opcodes!(@privileged $($privileged)?),)*
                }
            }
        }
    };
}

opcodes! {
    /// Load conditions and floating control immediate
    Lcfi = 0x02, Immediate;
    /// Call 1
    Cal1 = 0x04, Word;
    /// Call 2
    Cal2 = 0x05, Word;
    /// Call 3
    Cal3 = 0x06, Word;
    /// Call 4
    Cal4 = 0x07, Word;
    /// Pull word
    Plw = 0x08, Doubleword;
    /// Push word
    Psw = 0x09, Doubleword;
    /// Pull multiple
    Plm = 0x0A, Doubleword;
    /// Push multiple
    Psm = 0x0B, Doubleword;
    /// Load program status doubleword
    Lpsd = 0x0E, Doubleword, privileged;
    /// Exchange program status doubleword
    Xpsd = 0x0F, Doubleword, privileged;
    /// Add doubleword
    Ad = 0x10, Doubleword;
    /// Compare doubleword
    Cd = 0x11, Doubleword;
    /// Load doubleword
    Ld = 0x12, Doubleword;
    /// Modify stack pointer
    Msp = 0x13, Doubleword;
    /// Store doubleword
    Std = 0x15, Doubleword;
    /// Subtract doubleword
    Sd = 0x18, Doubleword;
    /// Compare with limits in memory
    Clm = 0x19, Doubleword;
    /// Load complement doubleword
    Lcd = 0x1A, Doubleword;
    /// Load absolute doubleword
    Lad = 0x1B, Doubleword;
    /// Floating subtract long
    Fsl = 0x1C, Doubleword;
    /// Floating add long
    Fal = 0x1D, Doubleword;
    /// Floating divide long
    Fdl = 0x1E, Doubleword;
    /// Floating multiply long
    Fml = 0x1F, Doubleword;
    /// Add immediate
    Ai = 0x20, Immediate;
    /// Compare immediate
    Ci = 0x21, Immediate;
    /// Load immediate
    Li = 0x22, Immediate;
    /// Multiply immediate
    Mi = 0x23, Immediate;
    /// Shift floating
    Sf = 0x24, Address;
    /// Shift
    S = 0x25, Address;
    /// Load and set
    Las = 0x26, Word;
    /// Convert by subtraction
    Cvs = 0x28, Word;
    /// Convert by addition
    Cva = 0x29, Word;
    /// Load multiple
    Lm = 0x2A, Word;
    /// Store multiple
    Stm = 0x2B, Word;
    /// Load real address
    Lra = 0x2C, Word, privileged;
    /// Wait for an interrupt
    Wait = 0x2E, Address, privileged;
    /// Load register pointer
    Lrp = 0x2F, Word, privileged;
    /// Add word
    Aw = 0x30, Word;
    /// Compare word
    Cw = 0x31, Word;
    /// Load word
    Lw = 0x32, Word;
    /// Modify and test word
    Mtw = 0x33, Word;
    /// Store word
    Stw = 0x35, Word;
    /// Divide word
    Dw = 0x36, Word;
    /// Multiply word
    Mw = 0x37, Word;
    /// Subtract word
    Sw = 0x38, Word;
    /// Compare with limits in registers
    Clr = 0x39, Word;
    /// Load complement word
    Lcw = 0x3A, Word;
    /// Load absolute word
    Law = 0x3B, Word;
    /// Floating subtract short
    Fss = 0x3C, Word;
    /// Floating add short
    Fas = 0x3D, Word;
    /// Floating divide short
    Fds = 0x3E, Word;
    /// Floating multiply short
    Fms = 0x3F, Word;
    /// Translate and test byte string
    Ttbs = 0x40, ByteString;
    /// Translate byte string
    Tbs = 0x41, ByteString;
    /// Analyze
    Anlz = 0x44, Word;
    /// Compare selective
    Cs = 0x45, Word;
    /// Exchange word
    Xw = 0x46, Word;
    /// Store selective
    Sts = 0x47, Word;
    /// Exclusive or word
    Eor = 0x48, Word;
    /// Or word
    Or = 0x49, Word;
    /// Load selective
    Ls = 0x4A, Word;
    /// And word
    And = 0x4B, Word;
    /// Start input/output
    Sio = 0x4C, Address, privileged;
    /// Test input/output
    Tio = 0x4D, Address, privileged;
    /// Test device
    Tdv = 0x4E, Address, privileged;
    /// Halt input/output
    Hio = 0x4F, Address, privileged;
    /// Add halfword
    Ah = 0x50, Halfword;
    /// Compare halfword
    Ch = 0x51, Halfword;
    /// Load halfword
    Lh = 0x52, Halfword;
    /// Modify and test halfword
    Mth = 0x53, Halfword;
    /// Store halfword
    Sth = 0x55, Halfword;
    /// Divide halfword
    Dh = 0x56, Halfword;
    /// Multiply halfword
    Mh = 0x57, Halfword;
    /// Subtract halfword
    Sh = 0x58, Halfword;
    /// Load complement halfword
    Lch = 0x5A, Halfword;
    /// Load absolute halfword
    Lah = 0x5B, Halfword;
    /// Compare byte string
    Cbs = 0x60, ByteString;
    /// Move byte string
    Mbs = 0x61, ByteString;
    /// Edit byte string
    Ebs = 0x63, ByteString;
    /// Branch on decrementing register
    Bdr = 0x64, Branch;
    /// Branch on incrementing register
    Bir = 0x65, Branch;
    /// Add word to memory
    Awm = 0x66, Word;
    /// Execute
    Exu = 0x67, Word;
    /// Branch on conditions reset
    Bcr = 0x68, Branch;
    /// Branch on conditions set
    Bcs = 0x69, Branch;
    /// Branch and link
    Bal = 0x6A, Branch;
    /// Interpret
    Int = 0x6B, Word;
    /// Read direct
    Rd = 0x6C, Address, privileged;
    /// Write direct
    Wd = 0x6D, Address, privileged;
    /// Acknowledge input/output interrupt
    Aio = 0x6E, Address, privileged;
    /// Move to memory control
    Mmc = 0x6F, Control, privileged;
    /// Load conditions and floating control
    Lcf = 0x70, Byte;
    /// Compare byte
    Cb = 0x71, Byte;
    /// Load byte
    Lb = 0x72, Byte;
    /// Modify and test byte
    Mtb = 0x73, Byte;
    /// Store conditions and floating control
    Stcf = 0x74, Byte;
    /// Store byte
    Stb = 0x75, Byte;
    /// Pack decimal digits
    Pack = 0x76, Byte;
    /// Unpack decimal digits
    Unpk = 0x77, Byte;
    /// Decimal subtract
    Ds = 0x78, Byte;
    /// Decimal add
    Da = 0x79, Byte;
    /// Decimal divide
    Dd = 0x7A, Byte;
    /// Decimal multiply
    Dm = 0x7B, Byte;
    /// Decimal shift arithmetic
    Dsa = 0x7C, Address;
    /// Decimal compare
    Dc = 0x7D, Byte;
    /// Decimal load
    Dl = 0x7E, Byte;
    /// Decimal store
    Dst = 0x7F, Byte;
}

/// An optional instruction group, missing from some processor configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(style = "lowercase")]
pub enum Feature {
    Floating,
    Decimal,
}

impl Opcode {
    /// The optional group the instruction belongs to, if any
    #[must_use]
    pub const fn feature(self) -> Option<Feature> {
        match self {
            Self::Fas
            | Self::Fss
            | Self::Fms
            | Self::Fds
            | Self::Fal
            | Self::Fsl
            | Self::Fml
            | Self::Fdl
            | Self::Sf => Some(Feature::Floating),
            Self::Pack
            | Self::Unpk
            | Self::Ds
            | Self::Da
            | Self::Dd
            | Self::Dm
            | Self::Dsa
            | Self::Dc
            | Self::Dl
            | Self::Dst
            | Self::Ebs => Some(Feature::Decimal),
            _ => None,
        }
    }

    /// Whether the instruction may transfer control, for step-until-branch
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(self.class(), OperandClass::Branch)
    }

    /// Whether the R field is a signed increment rather than a register
    #[must_use]
    pub const fn has_delta(self) -> bool {
        matches!(self, Self::Mtb | Self::Mth | Self::Mtw)
    }

    /// Find an opcode by its mnemonic, ignoring case
    #[must_use]
    pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.to_string().eq_ignore_ascii_case(mnemonic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_consistent_test() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_code(op.code()), Some(op));
            assert!(op.code() < 0x80);
        }

        assert_eq!(Opcode::ALL.len(), 108);
    }

    #[test]
    fn undefined_codes_test() {
        for code in [0x00, 0x01, 0x03, 0x0C, 0x0D, 0x14, 0x16, 0x17, 0x27, 0x2D, 0x34, 0x54, 0x62] {
            assert_eq!(Opcode::from_code(code), None, "code {code:#x}");
        }
    }

    #[test]
    fn mnemonic_test() {
        assert_eq!(Opcode::Cal1.to_string(), "CAL1");
        assert_eq!(Opcode::Lcfi.to_string(), "LCFI");
        assert_eq!(Opcode::from_mnemonic("xpsd"), Some(Opcode::Xpsd));
        assert_eq!(Opcode::from_mnemonic("nope"), None);
    }

    #[test]
    fn feature_test() {
        assert_eq!(Opcode::Fal.feature(), Some(Feature::Floating));
        assert_eq!(Opcode::Sf.feature(), Some(Feature::Floating));
        assert_eq!(Opcode::Ebs.feature(), Some(Feature::Decimal));
        assert_eq!(Opcode::Dsa.feature(), Some(Feature::Decimal));
        assert_eq!(Opcode::Lw.feature(), None);
        assert_eq!(Opcode::Mbs.feature(), None);

        let decimal = Opcode::ALL
            .iter()
            .filter(|op| op.feature() == Some(Feature::Decimal))
            .count();
        assert_eq!(decimal, 11);
    }

    #[test]
    fn privilege_test() {
        assert!(Opcode::Lpsd.is_privileged());
        assert!(Opcode::Mmc.is_privileged());
        assert!(Opcode::Wait.is_privileged());
        assert!(!Opcode::Lw.is_privileged());
        assert!(!Opcode::Cal1.is_privileged());
    }
}
