// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Binary TLV control protocol spoken on the status/command socket.
//!
//! Every datagram starts with one packet-type byte, followed by a
//! sequence of tag-length-value entries terminated by `Tag::Eol`. The
//! length is one byte; with the high bit set, the low seven bits give the
//! number of big-endian length bytes that follow. This layout is the wire
//! contract — both sides must match it bit-exactly.

pub mod decode;
pub mod encode;

pub use decode::{decode_socket, TlvScanner};

/// First byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Server-to-client status report.
    Status = 0,
    /// Client-to-server command.
    Cmd = 1,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Status),
            1 => Some(Self::Cmd),
            _ => None,
        }
    }
}

/// TLV tags. The numeric values are the wire contract; new tags may be
/// appended but existing values never change. Unknown tags are skipped by
/// receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Eol = 0,
    CommandTag = 1,
    CmdCnt = 2,
    GpsTime = 3,
    Description = 4,
    StatusDestSocket = 5,
    OutputSsrc = 6,
    RtpTimesnap = 7,
    RtpPt = 8,
    StatusInterval = 9,

    // Frontend
    InputSamprate = 10,
    InputSamples = 11,
    FeIsreal = 12,
    AdBitsPerSample = 13,
    Calibrate = 14,
    RfGain = 15,
    RfAtten = 16,
    RfAgc = 17,
    RfLevelCal = 18,
    LnaGain = 19,
    MixerGain = 20,
    IfGain = 21,
    FeLowEdge = 22,
    FeHighEdge = 23,
    IfPower = 24,
    AdOver = 25,
    SamplesSinceOver = 26,

    // Tuning
    RadioFrequency = 30,
    FirstLoFrequency = 31,
    SecondLoFrequency = 32,
    ShiftFrequency = 33,
    DopplerFrequency = 34,
    DopplerFrequencyRate = 35,

    // Filter
    LowEdge = 40,
    HighEdge = 41,
    KaiserBeta = 42,
    FilterBlocksize = 43,
    FilterFirLength = 44,
    FilterDrops = 45,
    Filter2 = 46,
    Filter2KaiserBeta = 47,
    Filter2Blocksize = 48,
    Filter2FirLength = 49,
    IndependentSideband = 50,

    // Signal estimators
    BasebandPower = 55,
    NoiseDensity = 56,
    FreqOffset = 57,

    // Demodulation, common
    DemodType = 60,
    Preset = 61,
    SnrSquelch = 62,
    SquelchOpen = 63,
    SquelchClose = 64,

    // FM
    ThreshExtend = 70,
    PeakDeviation = 71,
    DeemphTc = 72,
    DeemphGain = 73,
    FmSnr = 74,
    PlTone = 75,
    PlDeviation = 76,

    // Linear / PLL / AGC
    Envelope = 80,
    PllEnable = 81,
    PllBw = 82,
    PllSquare = 83,
    PllLock = 84,
    PllPhase = 85,
    PllWraps = 86,
    PllSnr = 87,
    AgcEnable = 88,
    Gain = 89,
    AgcHangtime = 90,
    AgcRecoveryRate = 91,
    AgcThreshold = 92,
    Headroom = 93,

    // Spectrum
    NoncoherentBinBw = 100,
    BinCount = 101,
    BinData = 102,

    // Output
    OutputSamprate = 110,
    OutputChannels = 111,
    OutputEncoding = 112,
    OutputDataDestSocket = 113,
    OutputDataSourceSocket = 114,
    OutputTtl = 115,
    OutputDataPackets = 116,
    OutputMetadataPackets = 117,
    OutputSamples = 118,
    OutputLevel = 119,
    OutputErrors = 120,
    OpusBitRate = 121,
    Minpacket = 122,

    // Misc
    Setopts = 130,
    Clearopts = 131,
    BlocksSincePoll = 132,
}

impl Tag {
    pub fn from_u8(value: u8) -> Option<Self> {
        use Tag::*;
        Some(match value {
            0 => Eol,
            1 => CommandTag,
            2 => CmdCnt,
            3 => GpsTime,
            4 => Description,
            5 => StatusDestSocket,
            6 => OutputSsrc,
            7 => RtpTimesnap,
            8 => RtpPt,
            9 => StatusInterval,
            10 => InputSamprate,
            11 => InputSamples,
            12 => FeIsreal,
            13 => AdBitsPerSample,
            14 => Calibrate,
            15 => RfGain,
            16 => RfAtten,
            17 => RfAgc,
            18 => RfLevelCal,
            19 => LnaGain,
            20 => MixerGain,
            21 => IfGain,
            22 => FeLowEdge,
            23 => FeHighEdge,
            24 => IfPower,
            25 => AdOver,
            26 => SamplesSinceOver,
            30 => RadioFrequency,
            31 => FirstLoFrequency,
            32 => SecondLoFrequency,
            33 => ShiftFrequency,
            34 => DopplerFrequency,
            35 => DopplerFrequencyRate,
            40 => LowEdge,
            41 => HighEdge,
            42 => KaiserBeta,
            43 => FilterBlocksize,
            44 => FilterFirLength,
            45 => FilterDrops,
            46 => Filter2,
            47 => Filter2KaiserBeta,
            48 => Filter2Blocksize,
            49 => Filter2FirLength,
            50 => IndependentSideband,
            55 => BasebandPower,
            56 => NoiseDensity,
            57 => FreqOffset,
            60 => DemodType,
            61 => Preset,
            62 => SnrSquelch,
            63 => SquelchOpen,
            64 => SquelchClose,
            70 => ThreshExtend,
            71 => PeakDeviation,
            72 => DeemphTc,
            73 => DeemphGain,
            74 => FmSnr,
            75 => PlTone,
            76 => PlDeviation,
            80 => Envelope,
            81 => PllEnable,
            82 => PllBw,
            83 => PllSquare,
            84 => PllLock,
            85 => PllPhase,
            86 => PllWraps,
            87 => PllSnr,
            88 => AgcEnable,
            89 => Gain,
            90 => AgcHangtime,
            91 => AgcRecoveryRate,
            92 => AgcThreshold,
            93 => Headroom,
            100 => NoncoherentBinBw,
            101 => BinCount,
            102 => BinData,
            110 => OutputSamprate,
            111 => OutputChannels,
            112 => OutputEncoding,
            113 => OutputDataDestSocket,
            114 => OutputDataSourceSocket,
            115 => OutputTtl,
            116 => OutputDataPackets,
            117 => OutputMetadataPackets,
            118 => OutputSamples,
            119 => OutputLevel,
            120 => OutputErrors,
            121 => OpusBitRate,
            122 => Minpacket,
            130 => Setopts,
            131 => Clearopts,
            132 => BlocksSincePoll,
            _ => return None,
        })
    }
}

/// Output encodings carried by OUTPUT_ENCODING. The daemon emits float or
/// int16 PCM itself; Opus is negotiated but encoded by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    None = 0,
    S16Be = 1,
    S16Le = 2,
    F32Le = 3,
    Opus = 4,
}

impl Encoding {
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::S16Be),
            2 => Some(Self::S16Le),
            3 => Some(Self::F32Le),
            4 => Some(Self::Opus),
            _ => None,
        }
    }

    /// Sample rates Opus accepts; other encodings take any rate.
    pub fn samprate_ok(self, samprate: u32) -> bool {
        match self {
            Encoding::Opus => {
                matches!(samprate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000)
            }
            _ => true,
        }
    }
}
