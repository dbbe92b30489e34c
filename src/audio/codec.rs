//! # Audio Codecs
//!
//! Encoders turn float samples into the bytes a client uploads; decoders pull
//! those bytes back out of an [`AudioPipe`] on the server.
//!
//! ## Supported codecs:
//! - **pcm**: raw signed 16-bit little-endian, params `"<rate>"` or `"<rate>/<channels>"`
//! - **ulaw**: G.711 µ-law, one byte per sample, same params
//! - **wav**: streaming RIFF/WAVE container carrying 16-bit PCM, empty params;
//!   the decoder reads the format from the RIFF header
//!
//! ## Negotiation:
//! The client announces `"<codec>|<params>"` once per session; the server
//! hands that string to [`CodecRegistry::create_decoder_from_header`].

use crate::audio::format::{float_sample_to_pcm, float_to_pcm, pcm_to_float, AudioSampleFormat};
use crate::audio::pipe::AudioPipe;
use crate::error::{SrError, SrResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Encodes local samples for upload.
pub trait AudioEncoder: Send {
    fn codec(&self) -> CodecKind;

    /// Parameter half of the `"<codec>|<params>"` header.
    fn codec_params(&self) -> String;

    /// Encode one block of interleaved samples. May return an empty buffer.
    fn encode(&mut self, samples: &[f32]) -> Bytes;

    /// Trailing bytes to send with `SEND_FINAL_AUDIO`.
    fn finish(&mut self) -> Bytes;
}

/// Decodes uploaded bytes on the server.
pub trait AudioDecoder: Send {
    fn codec(&self) -> CodecKind;

    /// Bytes to buffer before [`AudioDecoder::initialize`] is worth calling.
    fn header_bytes_required(&self) -> usize;

    /// Consume any container header and report the stream format.
    ///
    /// `Ok(None)` means the header is not complete yet; call again once more
    /// bytes are buffered. Nothing is consumed in that case.
    fn initialize(&mut self, pipe: &mut AudioPipe) -> SrResult<Option<AudioSampleFormat>>;

    /// Decode every complete sample currently in the pipe. Once the pipe is
    /// closed, trailing bytes that cannot form a sample are discarded.
    fn decode(&mut self, pipe: &mut AudioPipe) -> SrResult<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Pcm,
    Ulaw,
    Wav,
}

impl CodecKind {
    pub const ALL: [CodecKind; 3] = [CodecKind::Pcm, CodecKind::Ulaw, CodecKind::Wav];

    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Pcm => "pcm",
            CodecKind::Ulaw => "ulaw",
            CodecKind::Wav => "wav",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecKind {
    type Err = SrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm" | "s16le" => Ok(CodecKind::Pcm),
            "ulaw" | "mulaw" | "pcmu" => Ok(CodecKind::Ulaw),
            "wav" | "wave" => Ok(CodecKind::Wav),
            other => Err(SrError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Split an audio header payload into codec name and params.
pub fn parse_audio_header(header: &str) -> (&str, &str) {
    match header.split_once('|') {
        Some((codec, params)) => (codec.trim(), params.trim()),
        None => (header.trim(), ""),
    }
}

/// Builds encoders and decoders for the codecs this process accepts.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    enabled: Vec<CodecKind>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self {
            enabled: CodecKind::ALL.to_vec(),
        }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry restricted to the given codecs.
    pub fn with_codecs(enabled: impl IntoIterator<Item = CodecKind>) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn supported(&self) -> Vec<&'static str> {
        self.enabled.iter().map(CodecKind::name).collect()
    }

    /// Resolve a codec name, failing for unknown or disabled codecs.
    pub fn resolve(&self, name: &str) -> SrResult<CodecKind> {
        let kind: CodecKind = name.parse()?;
        if self.enabled.contains(&kind) {
            Ok(kind)
        } else {
            Err(SrError::UnsupportedCodec(name.to_string()))
        }
    }

    pub fn create_encoder(
        &self,
        codec: &str,
        format: AudioSampleFormat,
    ) -> SrResult<Box<dyn AudioEncoder>> {
        format.validate()?;
        let encoder: Box<dyn AudioEncoder> = match self.resolve(codec)? {
            CodecKind::Pcm => Box::new(PcmEncoder { format }),
            CodecKind::Ulaw => Box::new(UlawEncoder { format }),
            CodecKind::Wav => Box::new(WavEncoder {
                format,
                header_written: false,
            }),
        };
        Ok(encoder)
    }

    pub fn create_decoder(&self, codec: &str, params: &str) -> SrResult<Box<dyn AudioDecoder>> {
        let decoder: Box<dyn AudioDecoder> = match self.resolve(codec)? {
            CodecKind::Pcm => Box::new(PcmDecoder {
                format: AudioSampleFormat::parse_params(params)?,
            }),
            CodecKind::Ulaw => Box::new(UlawDecoder {
                format: AudioSampleFormat::parse_params(params)?,
            }),
            CodecKind::Wav => Box::new(WavDecoder { format: None }),
        };
        Ok(decoder)
    }

    /// Build a decoder straight from a `"<codec>|<params>"` header.
    pub fn create_decoder_from_header(&self, header: &str) -> SrResult<Box<dyn AudioDecoder>> {
        let (codec, params) = parse_audio_header(header);
        self.create_decoder(codec, params)
    }
}

fn encode_pcm(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in float_to_pcm(samples) {
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    Bytes::from(out)
}

fn decode_pcm(bytes: &[u8]) -> Vec<f32> {
    let mut pcm = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes[..pcm.len() * 2], &mut pcm);
    pcm_to_float(&pcm)
}

struct PcmEncoder {
    format: AudioSampleFormat,
}

impl AudioEncoder for PcmEncoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Pcm
    }

    fn codec_params(&self) -> String {
        self.format.to_params()
    }

    fn encode(&mut self, samples: &[f32]) -> Bytes {
        encode_pcm(samples)
    }

    fn finish(&mut self) -> Bytes {
        Bytes::new()
    }
}

struct PcmDecoder {
    format: AudioSampleFormat,
}

impl AudioDecoder for PcmDecoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Pcm
    }

    fn header_bytes_required(&self) -> usize {
        0
    }

    fn initialize(&mut self, _pipe: &mut AudioPipe) -> SrResult<Option<AudioSampleFormat>> {
        Ok(Some(self.format))
    }

    fn decode(&mut self, pipe: &mut AudioPipe) -> SrResult<Vec<f32>> {
        let bytes = pipe.read_aligned(2);
        if pipe.is_closed() && pipe.available() > 0 {
            tracing::debug!(bytes = pipe.available(), "discarding trailing partial sample");
            pipe.skip(pipe.available());
        }
        Ok(decode_pcm(&bytes))
    }
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn ulaw_encode(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0 };
    let magnitude = (sample as i32).abs().min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while magnitude & mask == 0 && exponent > 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

pub fn ulaw_decode(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

struct UlawEncoder {
    format: AudioSampleFormat,
}

impl AudioEncoder for UlawEncoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Ulaw
    }

    fn codec_params(&self) -> String {
        self.format.to_params()
    }

    fn encode(&mut self, samples: &[f32]) -> Bytes {
        samples
            .iter()
            .map(|&s| ulaw_encode(float_sample_to_pcm(s)))
            .collect::<Vec<u8>>()
            .into()
    }

    fn finish(&mut self) -> Bytes {
        Bytes::new()
    }
}

struct UlawDecoder {
    format: AudioSampleFormat,
}

impl AudioDecoder for UlawDecoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Ulaw
    }

    fn header_bytes_required(&self) -> usize {
        0
    }

    fn initialize(&mut self, _pipe: &mut AudioPipe) -> SrResult<Option<AudioSampleFormat>> {
        Ok(Some(self.format))
    }

    fn decode(&mut self, pipe: &mut AudioPipe) -> SrResult<Vec<f32>> {
        let bytes = pipe.read(pipe.available());
        let pcm: Vec<i16> = bytes.iter().map(|&b| ulaw_decode(b)).collect();
        Ok(pcm_to_float(&pcm))
    }
}

/// Canonical RIFF header length for 16-bit PCM.
pub const WAV_HEADER_LEN: usize = 44;

/// Streaming RIFF header. Sizes are unknown up front, so they are written
/// as `0xFFFFFFFF` the way live encoders do.
pub fn wav_header(format: AudioSampleFormat) -> [u8; WAV_HEADER_LEN] {
    let block_align = format.channels * 2;
    let byte_rate = format.sample_rate * block_align as u32;

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], u32::MAX);
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], 1);
    LittleEndian::write_u16(&mut header[22..24], format.channels);
    LittleEndian::write_u32(&mut header[24..28], format.sample_rate);
    LittleEndian::write_u32(&mut header[28..32], byte_rate);
    LittleEndian::write_u16(&mut header[32..34], block_align);
    LittleEndian::write_u16(&mut header[34..36], 16);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], u32::MAX);
    header
}

struct WavEncoder {
    format: AudioSampleFormat,
    header_written: bool,
}

impl WavEncoder {
    fn take_header(&mut self) -> Option<[u8; WAV_HEADER_LEN]> {
        if self.header_written {
            return None;
        }
        self.header_written = true;
        Some(wav_header(self.format))
    }
}

impl AudioEncoder for WavEncoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Wav
    }

    fn codec_params(&self) -> String {
        String::new()
    }

    fn encode(&mut self, samples: &[f32]) -> Bytes {
        let body = encode_pcm(samples);
        match self.take_header() {
            Some(header) => {
                let mut out = Vec::with_capacity(WAV_HEADER_LEN + body.len());
                out.extend_from_slice(&header);
                out.extend_from_slice(&body);
                Bytes::from(out)
            }
            None => body,
        }
    }

    fn finish(&mut self) -> Bytes {
        // A stream that never carried audio still needs a valid header
        match self.take_header() {
            Some(header) => Bytes::copy_from_slice(&header),
            None => Bytes::new(),
        }
    }
}

struct WavDecoder {
    format: Option<AudioSampleFormat>,
}

impl WavDecoder {
    /// Walk the RIFF chunks up to `data`; returns the format and the data offset.
    fn parse_header(bytes: &[u8]) -> SrResult<Option<(AudioSampleFormat, usize)>> {
        if bytes.len() < 12 {
            return Ok(None);
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(SrError::Protocol("audio stream is not RIFF/WAVE".to_string()));
        }

        let mut format = None;
        let mut offset = 12;
        while offset + 8 <= bytes.len() {
            let id = &bytes[offset..offset + 4];
            let size = LittleEndian::read_u32(&bytes[offset + 4..offset + 8]) as usize;
            let body = offset + 8;

            if id == b"data" {
                return match format {
                    Some(format) => Ok(Some((format, body))),
                    None => Err(SrError::Protocol("WAVE data before fmt chunk".to_string())),
                };
            }

            if id == b"fmt " {
                if body + 16 > bytes.len() {
                    return Ok(None);
                }
                let mut cursor = Cursor::new(&bytes[body..body + 16]);
                let audio_format = cursor.read_u16::<LittleEndian>()?;
                let channels = cursor.read_u16::<LittleEndian>()?;
                let sample_rate = cursor.read_u32::<LittleEndian>()?;
                let _byte_rate = cursor.read_u32::<LittleEndian>()?;
                let _block_align = cursor.read_u16::<LittleEndian>()?;
                let bits = cursor.read_u16::<LittleEndian>()?;

                if audio_format != 1 || bits != 16 {
                    return Err(SrError::UnsupportedCodec(format!(
                        "wav (format {}, {} bits)",
                        audio_format, bits
                    )));
                }
                let parsed = AudioSampleFormat::new(sample_rate, channels);
                parsed.validate()?;
                format = Some(parsed);
            }

            // Chunks are word aligned
            offset = body.saturating_add(size).saturating_add(size & 1);
        }
        Ok(None)
    }
}

impl AudioDecoder for WavDecoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Wav
    }

    fn header_bytes_required(&self) -> usize {
        WAV_HEADER_LEN
    }

    fn initialize(&mut self, pipe: &mut AudioPipe) -> SrResult<Option<AudioSampleFormat>> {
        let Some((format, data_offset)) = Self::parse_header(pipe.peek())? else {
            return Ok(None);
        };
        pipe.skip(data_offset);
        self.format = Some(format);
        Ok(Some(format))
    }

    fn decode(&mut self, pipe: &mut AudioPipe) -> SrResult<Vec<f32>> {
        let format = self
            .format
            .ok_or_else(|| SrError::Protocol("wav decoder used before initialize".to_string()))?;
        let bytes = pipe.read_aligned(2 * format.channels as usize);
        if pipe.is_closed() && pipe.available() > 0 {
            pipe.skip(pipe.available());
        }
        Ok(decode_pcm(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.05).sin() * 0.5).collect()
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(parse_audio_header("pcm|16000"), ("pcm", "16000"));
        assert_eq!(parse_audio_header("wav|"), ("wav", ""));
        assert_eq!(parse_audio_header("ulaw"), ("ulaw", ""));
    }

    #[test]
    fn test_unsupported_codec_rejected() {
        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.create_decoder_from_header("opus|48000"),
            Err(SrError::UnsupportedCodec(_))
        ));

        let pcm_only = CodecRegistry::with_codecs([CodecKind::Pcm]);
        assert!(pcm_only.create_decoder("ulaw", "8000").is_err());
        assert_eq!(pcm_only.supported(), vec!["pcm"]);
    }

    #[test]
    fn test_pcm_decoder_is_chunking_invariant() {
        let registry = CodecRegistry::new();
        let mut encoder = registry
            .create_encoder("pcm", AudioSampleFormat::speech())
            .unwrap();
        assert_eq!(encoder.codec_params(), "16000");
        let encoded = encoder.encode(&tone(500));

        let mut whole = registry.create_decoder("pcm", "16000").unwrap();
        let mut pipe = AudioPipe::new();
        pipe.write(&encoded);
        whole.initialize(&mut pipe).unwrap();
        let expected = whole.decode(&mut pipe).unwrap();

        let mut chunked = registry.create_decoder("pcm", "16000").unwrap();
        let mut pipe = AudioPipe::new();
        chunked.initialize(&mut pipe).unwrap();
        let mut actual = Vec::new();
        for chunk in encoded.chunks(7) {
            pipe.write(chunk);
            actual.extend(chunked.decode(&mut pipe).unwrap());
        }
        assert_eq!(actual, expected);
        assert_eq!(actual.len(), 500);
    }

    #[test]
    fn test_ulaw_is_close_to_source() {
        for sample in [0i16, 100, -100, 1000, -8000, 32000, i16::MIN] {
            let decoded = ulaw_decode(ulaw_encode(sample));
            let error = (decoded as i32 - sample as i32).abs();
            // Quantisation step grows with magnitude
            assert!(error <= (sample as i32).abs() / 16 + 8, "{} -> {}", sample, decoded);
        }
        assert_eq!(ulaw_encode(0), 0xFF);
    }

    #[test]
    fn test_wav_stream_sniffs_format_from_header() {
        let registry = CodecRegistry::new();
        let format = AudioSampleFormat::new(8000, 2);
        let mut encoder = registry.create_encoder("wav", format).unwrap();
        assert_eq!(encoder.codec_params(), "");

        let mut pipe = AudioPipe::new();
        pipe.write(&encoder.encode(&tone(200)));
        pipe.write(&encoder.encode(&tone(100)));
        pipe.write(&encoder.finish());
        pipe.close();

        let mut decoder = registry.create_decoder_from_header("wav|").unwrap();
        assert_eq!(decoder.header_bytes_required(), WAV_HEADER_LEN);
        assert_eq!(decoder.initialize(&mut pipe).unwrap(), Some(format));
        assert_eq!(decoder.decode(&mut pipe).unwrap().len(), 300);
    }

    #[test]
    fn test_wav_rejects_non_riff_data() {
        let mut pipe = AudioPipe::new();
        pipe.write(&[0u8; 64]);
        let mut decoder = CodecRegistry::new().create_decoder("wav", "").unwrap();
        assert!(decoder.initialize(&mut pipe).is_err());
    }

    #[test]
    fn test_wav_waits_for_header_behind_extra_chunks() {
        let format = AudioSampleFormat::speech();
        let canonical = wav_header(format);

        // RIFF + fmt, then a LIST chunk before data
        let mut stream = canonical[..36].to_vec();
        stream.extend_from_slice(b"LIST");
        stream.extend_from_slice(&700u32.to_le_bytes());
        stream.extend(std::iter::repeat(b'x').take(700));
        stream.extend_from_slice(&canonical[36..]);
        stream.extend_from_slice(&[0u8; 200]);

        let mut decoder = CodecRegistry::new().create_decoder("wav", "").unwrap();
        let mut pipe = AudioPipe::new();
        pipe.write(&stream[..640]);
        assert_eq!(decoder.initialize(&mut pipe).unwrap(), None);
        assert_eq!(pipe.available(), 640);

        pipe.write(&stream[640..]);
        assert_eq!(decoder.initialize(&mut pipe).unwrap(), Some(format));
        assert_eq!(decoder.decode(&mut pipe).unwrap().len(), 100);
    }
}
