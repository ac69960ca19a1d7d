//! Operations scheduled on a buffer during its lifetime.
//!
//! Each operation is recorded at an offset and keyed by its
//! [`OperationKind`], so writing the same kind twice at one offset keeps
//! only the last write. Kinds are emitted in their declared order: reads and
//! fills after allocation, writes and closes just before the buffer is freed.

use std::path::PathBuf;

use crate::entity::EntityId;

/// Sound file container for buffer writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeaderFormat {
    #[default]
    Aiff,
    Wav,
    Next,
    Ircam,
    Raw,
}

impl HeaderFormat {
    /// Name as understood by `/b_write`.
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderFormat::Aiff => "aiff",
            HeaderFormat::Wav => "wav",
            HeaderFormat::Next => "next",
            HeaderFormat::Ircam => "ircam",
            HeaderFormat::Raw => "raw",
        }
    }
}

/// Sample encoding for buffer writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleFormat {
    Int8,
    Int16,
    #[default]
    Int24,
    Int32,
    Float,
    Double,
    Mulaw,
    Alaw,
}

impl SampleFormat {
    /// Name as understood by `/b_write`.
    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::Int8 => "int8",
            SampleFormat::Int16 => "int16",
            SampleFormat::Int24 => "int24",
            SampleFormat::Int32 => "int32",
            SampleFormat::Float => "float",
            SampleFormat::Double => "double",
            SampleFormat::Mulaw => "mulaw",
            SampleFormat::Alaw => "alaw",
        }
    }
}

/// Waveform fill for `/b_gen`.
#[derive(Clone, Debug, PartialEq)]
pub enum Generator {
    /// Chebyshev polynomial amplitudes.
    Chebyshev { amplitudes: Vec<f64> },
    /// Harmonic partial amplitudes.
    Sine1 { amplitudes: Vec<f64> },
    /// Partials with explicit frequencies.
    Sine2 {
        frequencies: Vec<f64>,
        amplitudes: Vec<f64>,
    },
    /// Partials with explicit frequencies and phases.
    Sine3 {
        frequencies: Vec<f64>,
        amplitudes: Vec<f64>,
        phases: Vec<f64>,
    },
}

impl Generator {
    /// The `/b_gen` command name.
    pub fn command_name(&self) -> &'static str {
        match self {
            Generator::Chebyshev { .. } => "cheby",
            Generator::Sine1 { .. } => "sine1",
            Generator::Sine2 { .. } => "sine2",
            Generator::Sine3 { .. } => "sine3",
        }
    }

    /// Flattened coefficient list: frequency-first tuples for the sine2/sine3 forms.
    pub fn coefficients(&self) -> Vec<f64> {
        match self {
            Generator::Chebyshev { amplitudes } | Generator::Sine1 { amplitudes } => amplitudes.clone(),
            Generator::Sine2 {
                frequencies,
                amplitudes,
            } => frequencies
                .iter()
                .zip(amplitudes)
                .flat_map(|(f, a)| [*f, *a])
                .collect(),
            Generator::Sine3 {
                frequencies,
                amplitudes,
                phases,
            } => frequencies
                .iter()
                .zip(amplitudes)
                .zip(phases)
                .flat_map(|((f, a), p)| [*f, *a, *p])
                .collect(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        let (len, consistent) = match self {
            Generator::Chebyshev { amplitudes } | Generator::Sine1 { amplitudes } => (amplitudes.len(), true),
            Generator::Sine2 {
                frequencies,
                amplitudes,
            } => (amplitudes.len(), frequencies.len() == amplitudes.len()),
            Generator::Sine3 {
                frequencies,
                amplitudes,
                phases,
            } => (
                amplitudes.len(),
                frequencies.len() == amplitudes.len() && phases.len() == amplitudes.len(),
            ),
        };
        if len == 0 {
            return Err("generator needs at least one amplitude");
        }
        if !consistent {
            return Err("generator coefficient lists differ in length");
        }
        Ok(())
    }
}

/// Emission slot of a buffer operation within an offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Read,
    Zero,
    Fill,
    Generate,
    Set,
    SetContiguous,
    Normalize,
    Copy,
    Write,
    Close,
}

impl OperationKind {
    /// Whether the kind runs after node frees instead of after allocation.
    pub fn is_pre_free(self) -> bool {
        matches!(self, OperationKind::Write | OperationKind::Close)
    }
}

/// A non-lifecycle buffer command.
#[derive(Clone, Debug, PartialEq)]
pub enum BufferOperation {
    /// Read a sound file into the buffer. With `channels`, only those channels.
    Read {
        path: PathBuf,
        channels: Option<Vec<u32>>,
        frame_count: Option<u32>,
        starting_frame_in_buffer: u32,
        starting_frame_in_file: u32,
        leave_open: bool,
    },
    /// Set every sample to zero.
    Zero,
    /// `(index, count, value)` runs.
    Fill { triples: Vec<(u32, u32, f64)> },
    /// Fill with a generated waveform.
    Generate {
        generator: Generator,
        normalize: bool,
        as_wavetable: bool,
        clear_first: bool,
    },
    /// `(index, value)` samples.
    Set { pairs: Vec<(u32, f64)> },
    /// `(index, values)` runs of consecutive samples.
    SetContiguous { runs: Vec<(u32, Vec<f64>)> },
    /// Scale so the peak equals `new_maximum`.
    Normalize { new_maximum: f64, as_wavetable: bool },
    /// Copy samples from this buffer into `target`.
    Copy {
        target: EntityId,
        frame_count: Option<u32>,
        source_starting_frame: u32,
        target_starting_frame: u32,
    },
    /// Write the buffer to a sound file.
    Write {
        path: PathBuf,
        header_format: HeaderFormat,
        sample_format: SampleFormat,
        frame_count: Option<u32>,
        starting_frame: u32,
        leave_open: bool,
    },
    /// Close a file left open by a read or write.
    Close,
}

impl BufferOperation {
    /// Read a whole file from its first frame.
    pub fn read(path: impl Into<PathBuf>) -> Self {
        BufferOperation::Read {
            path: path.into(),
            channels: None,
            frame_count: None,
            starting_frame_in_buffer: 0,
            starting_frame_in_file: 0,
            leave_open: false,
        }
    }

    /// Write the whole buffer as 24-bit AIFF.
    pub fn write(path: impl Into<PathBuf>) -> Self {
        BufferOperation::Write {
            path: path.into(),
            header_format: HeaderFormat::default(),
            sample_format: SampleFormat::default(),
            frame_count: None,
            starting_frame: 0,
            leave_open: false,
        }
    }

    /// Generate a normalized wavetable, clearing the buffer first.
    pub fn generate(generator: Generator) -> Self {
        BufferOperation::Generate {
            generator,
            normalize: true,
            as_wavetable: true,
            clear_first: true,
        }
    }

    /// Copy the whole buffer to the start of `target`.
    pub fn copy_to(target: EntityId) -> Self {
        BufferOperation::Copy {
            target,
            frame_count: None,
            source_starting_frame: 0,
            target_starting_frame: 0,
        }
    }

    /// Keep the sound file open after a read or write. Other kinds are unchanged.
    pub fn leaving_open(mut self) -> Self {
        if let BufferOperation::Read { leave_open, .. } | BufferOperation::Write { leave_open, .. } = &mut self {
            *leave_open = true;
        }
        self
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            BufferOperation::Read { .. } => OperationKind::Read,
            BufferOperation::Zero => OperationKind::Zero,
            BufferOperation::Fill { .. } => OperationKind::Fill,
            BufferOperation::Generate { .. } => OperationKind::Generate,
            BufferOperation::Set { .. } => OperationKind::Set,
            BufferOperation::SetContiguous { .. } => OperationKind::SetContiguous,
            BufferOperation::Normalize { .. } => OperationKind::Normalize,
            BufferOperation::Copy { .. } => OperationKind::Copy,
            BufferOperation::Write { .. } => OperationKind::Write,
            BufferOperation::Close => OperationKind::Close,
        }
    }

    /// Whether the operation leaves a sound file open on the server.
    pub fn leaves_open(&self) -> bool {
        matches!(
            self,
            BufferOperation::Read { leave_open: true, .. } | BufferOperation::Write { leave_open: true, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_ordered_for_emission() {
        let mut kinds = vec![
            OperationKind::Write,
            OperationKind::Copy,
            OperationKind::Read,
            OperationKind::Generate,
            OperationKind::Zero,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                OperationKind::Read,
                OperationKind::Zero,
                OperationKind::Generate,
                OperationKind::Copy,
                OperationKind::Write,
            ]
        );
        assert!(OperationKind::Write.is_pre_free());
        assert!(!OperationKind::Copy.is_pre_free());
    }

    #[test]
    fn test_generator_coefficients() {
        let sine3 = Generator::Sine3 {
            frequencies: vec![1.0, 2.0],
            amplitudes: vec![0.5, 0.25],
            phases: vec![0.0, 3.0],
        };
        assert_eq!(sine3.command_name(), "sine3");
        assert_eq!(sine3.coefficients(), vec![1.0, 0.5, 0.0, 2.0, 0.25, 3.0]);

        let mismatched = Generator::Sine2 {
            frequencies: vec![1.0],
            amplitudes: vec![0.5, 0.25],
        };
        assert!(mismatched.validate().is_err());
        assert!(Generator::Chebyshev { amplitudes: Vec::new() }.validate().is_err());
    }

    #[test]
    fn test_leaving_open() {
        assert!(BufferOperation::read("a.wav").leaving_open().leaves_open());
        assert!(!BufferOperation::write("a.aiff").leaves_open());
        assert_eq!(BufferOperation::Zero.leaving_open(), BufferOperation::Zero);
    }
}
