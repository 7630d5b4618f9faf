//! Codec-Konvertierung zwischen Voice-AI und Telefonie-Strecke
//!
//! Die Voice-AI spricht rohes PCM (linear16) mit konfigurierbarer
//! Sample-Rate, die Telefonie-Strecke den ausgehandelten Codec des Anrufs.
//! Die Konvertierung ist als Trait steckbar; mitgeliefert sind
//! Durchreichen (Formate identisch) und G.711 µ-law bei 8 kHz, der übliche
//! Verhandlungsausgang an dieser PBX-Klasse.

use once_cell::sync::Lazy;

/// Sample-Rate der Telefonie-Strecke bei G.711
pub const TELEPHONY_RATE: u32 = 8000;

// ============================================================================
// TRANSCODER TRAIT
// ============================================================================

/// Konvertiert Audio zwischen Agent-Format und Leitungs-Codec
///
/// Beide Richtungen arbeiten Frame-weise und zustandslos; die Bridge ruft
/// sie aus ihren Relay-Tasks heraus auf.
pub trait Transcoder: Send + Sync {
    /// Agent-PCM → Leitungs-Codec (Richtung Anrufer)
    fn to_caller(&self, frame: &[u8]) -> Vec<u8>;

    /// Leitungs-Codec → Agent-PCM (Richtung Voice-AI)
    fn to_agent(&self, frame: &[u8]) -> Vec<u8>;
}

/// Wählt den Transcoder zum konfigurierten Agent-Format
///
/// Spricht der Agent bereits µ-law bei 8 kHz, fließen die Frames
/// unverändert; bei linear16 wird zwischen Agent-Rate und G.711 gewandelt.
pub fn select_transcoder(encoding: &str, agent_rate: u32) -> Box<dyn Transcoder> {
    match encoding {
        "mulaw" | "ulaw" => Box::new(Passthrough),
        _ => Box::new(G711Ulaw { agent_rate }),
    }
}

// ============================================================================
// PASSTHROUGH
// ============================================================================

/// Durchreichen ohne Konvertierung (Formate beider Seiten identisch)
pub struct Passthrough;

impl Transcoder for Passthrough {
    fn to_caller(&self, frame: &[u8]) -> Vec<u8> {
        frame.to_vec()
    }

    fn to_agent(&self, frame: &[u8]) -> Vec<u8> {
        frame.to_vec()
    }
}

// ============================================================================
// G.711 µ-LAW
// ============================================================================

/// linear16 (Agent-Rate) ↔ G.711 µ-law (8 kHz)
pub struct G711Ulaw {
    pub agent_rate: u32,
}

impl Transcoder for G711Ulaw {
    fn to_caller(&self, frame: &[u8]) -> Vec<u8> {
        let samples = pcm_to_samples(frame);
        let samples = resample_linear(&samples, self.agent_rate, TELEPHONY_RATE);
        samples.iter().map(|&s| linear_to_ulaw(s)).collect()
    }

    fn to_agent(&self, frame: &[u8]) -> Vec<u8> {
        let samples: Vec<i16> = frame.iter().map(|&b| ulaw_to_linear(b)).collect();
        let samples = resample_linear(&samples, TELEPHONY_RATE, self.agent_rate);
        samples_to_pcm(&samples)
    }
}

/// Kodiert ein 16-bit Sample nach µ-law (G.711)
fn linear_to_ulaw(sample: i16) -> u8 {
    const CLIP: i32 = 32_635;
    const BIAS: i32 = 0x84;

    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Dekodiertabelle µ-law → linear16
static ULAW_TABLE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (byte, entry) in table.iter_mut().enumerate() {
        let byte = !(byte as u8);
        let sign = byte & 0x80;
        let exponent = (byte >> 4) & 0x07;
        let mantissa = byte & 0x0F;
        let mut sample = (((mantissa as i32) << 3) + 0x84) << exponent;
        sample -= 0x84;
        *entry = if sign != 0 { -sample as i16 } else { sample as i16 };
    }
    table
});

/// Dekodiert ein µ-law Byte nach linear16
fn ulaw_to_linear(byte: u8) -> i16 {
    ULAW_TABLE[byte as usize]
}

/// Lineares Resampling zwischen zwei Sample-Rates
///
/// Einfache Linear-Interpolation; für Sprache auf der Telefonstrecke
/// ausreichend.
fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (input.len() as f32 * ratio) as usize;

    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = input.get(idx).copied().unwrap_or(0);
            let s2 = input.get(idx + 1).copied().unwrap_or(s1);
            (s1 as f32 + (s2 as f32 - s1 as f32) * frac) as i16
        })
        .collect()
}

/// Little-Endian PCM-Bytes → Samples
fn pcm_to_samples(frame: &[u8]) -> Vec<i16> {
    frame
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Samples → Little-Endian PCM-Bytes
fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

// ============================================================================
// TESTS
// ============================================================================
