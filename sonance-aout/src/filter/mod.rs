//! Filter chains: format conversion between pipeline stages
//!
//! A [`FilterChain`] is an ordered list of [`FilterStage`]s where each stage's
//! output format equals the next stage's input format. Chains are built by a
//! breadth-first search over a static catalogue of stage factories, so the
//! chain found is the shortest one. Among equally short chains, the factory
//! with the higher priority wins.
//!
//! Catalogue:
//!
//! | stage      | converts                          | in place         |
//! |------------|-----------------------------------|------------------|
//! | `convert`  | integer encoding ↔ fl32           | when widths match|
//! | `byteswap` | s16l ↔ s16b                       | yes              |
//! | `remix`    | channel layout (fl32)             | no               |
//! | `resample` | sample rate (fl32, rubato)        | no               |
//!
//! The drift-correcting `linear` resampler and the channel `remap` stage are
//! not part of the search; pipelines append them explicitly.

pub mod channels;
pub mod convert;
pub mod drift;
pub mod resample;

pub use channels::{Remap, Remix};
pub use convert::{ByteSwap, Convert};
pub use drift::{DriftParams, DriftTracker, Resampling};
pub use resample::{LinearResampler, Resample};

use crate::buffer::{allocate, Allocation, AllocationPolicy, AudioBuffer};
use crate::error::{AoutError, Result};
use crate::format::AudioSampleFormat;
use sonance_common::timing::{Mtime, CLOCK_FREQ};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// One format conversion step
pub trait FilterStage: Send {
    fn name(&self) -> &'static str;

    fn input_format(&self) -> &AudioSampleFormat;

    fn output_format(&self) -> &AudioSampleFormat;

    /// May write its output into the input buffer
    fn in_place(&self) -> bool {
        false
    }

    /// Carries state between buffers and must be reset on discontinuity
    fn keeps_history(&self) -> bool {
        false
    }

    /// Upper bound of output frames for `input_frames` frames of input
    fn max_output_frames(&self, input_frames: usize) -> usize {
        input_frames
    }

    /// Convert `input` into the empty, pre-allocated `output`
    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()>;

    /// Convert `buffer` in place; only called when [`FilterStage::in_place`]
    fn process_in_place(&mut self, _buffer: &mut AudioBuffer) -> Result<()> {
        Err(AoutError::Filter {
            stage: self.name(),
            reason: "in-place processing unsupported".to_string(),
        })
    }

    /// Input taken in but not output yet, as playback time
    fn held_duration(&self) -> Mtime {
        0
    }

    /// Forget history after a discontinuity
    fn reset(&mut self) {}
}

type CanHandle = fn(&AudioSampleFormat, &AudioSampleFormat) -> bool;
type Create = fn(&AudioSampleFormat, &AudioSampleFormat) -> Result<Box<dyn FilterStage>>;

/// Catalogue entry: a stage kind with its capability test
struct StageFactory {
    name: &'static str,
    priority: u8,
    can_handle: CanHandle,
    create: Create,
}

/// Stage catalogue, highest priority first
static CATALOGUE: [StageFactory; 4] = [
    StageFactory {
        name: "byteswap",
        priority: 30,
        can_handle: ByteSwap::can_handle,
        create: ByteSwap::create,
    },
    StageFactory {
        name: "convert",
        priority: 20,
        can_handle: Convert::can_handle,
        create: Convert::create,
    },
    StageFactory {
        name: "remix",
        priority: 10,
        can_handle: Remix::can_handle,
        create: Remix::create,
    },
    StageFactory {
        name: "resample",
        priority: 5,
        can_handle: Resample::can_handle,
        create: Resample::create,
    },
];

/// Intermediate formats the search may pass through
fn candidate_formats(src: &AudioSampleFormat, tgt: &AudioSampleFormat) -> Vec<AudioSampleFormat> {
    let encodings = [src.encoding(), tgt.encoding(), crate::format::SampleEncoding::Fl32];
    let channels = [src.channels(), tgt.channels()];
    let rates = [src.rate(), tgt.rate()];

    let mut formats = Vec::new();
    for encoding in encodings {
        for mask in channels {
            for rate in rates {
                let format = AudioSampleFormat::new(encoding, mask, rate);
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }
    }
    formats
}

/// Shortest sequence of (factory, input, output) from `src` to `tgt`
fn find_path(
    src: &AudioSampleFormat,
    tgt: &AudioSampleFormat,
) -> Option<Vec<(&'static StageFactory, AudioSampleFormat, AudioSampleFormat)>> {
    let candidates = candidate_formats(src, tgt);
    let mut previous: HashMap<AudioSampleFormat, (AudioSampleFormat, usize)> = HashMap::new();
    let mut seen: HashSet<AudioSampleFormat> = HashSet::from([*src]);
    let mut queue = VecDeque::from([*src]);

    while let Some(current) = queue.pop_front() {
        if current == *tgt {
            let mut path = Vec::new();
            let mut node = current;
            while let Some((from, factory)) = previous.get(&node) {
                path.push((&CATALOGUE[*factory], *from, node));
                node = *from;
            }
            path.reverse();
            return Some(path);
        }

        for (index, factory) in CATALOGUE.iter().enumerate() {
            for next in &candidates {
                if !seen.contains(next) && (factory.can_handle)(&current, next) {
                    seen.insert(*next);
                    previous.insert(*next, (current, index));
                    queue.push_back(*next);
                }
            }
        }
    }
    None
}

/// Duration covering `frames` frames at `rate`, rounded up
fn frames_duration_ceil(frames: usize, rate: u32) -> Mtime {
    (frames as u128 * CLOCK_FREQ as u128).div_ceil(rate.max(1) as u128) as Mtime
}

/// Ordered stages converting one format into another
pub struct FilterChain {
    stages: Vec<Box<dyn FilterStage>>,
    policies: Vec<AllocationPolicy>,
    first_alloc: AllocationPolicy,
    input: AudioSampleFormat,
    output: AudioSampleFormat,
}

impl FilterChain {
    /// Pass-through chain
    pub fn empty(format: AudioSampleFormat) -> Self {
        Self {
            stages: Vec::new(),
            policies: Vec::new(),
            first_alloc: AllocationPolicy::Allocate {
                bytes_per_second: format.bytes_per_second(),
            },
            input: format,
            output: format,
        }
    }

    /// Build the shortest chain from `src` to `tgt`
    ///
    /// Equal formats yield an empty chain. Fails with
    /// [`AoutError::NoFilterChain`] when no sequence of catalogue stages fits.
    pub fn build(src: &AudioSampleFormat, tgt: &AudioSampleFormat) -> Result<Self> {
        src.validate()?;
        tgt.validate()?;

        let mut chain = Self::empty(*src);
        if src == tgt {
            return Ok(chain);
        }

        let path = find_path(src, tgt).ok_or_else(|| AoutError::NoFilterChain {
            from: src.to_string(),
            to: tgt.to_string(),
        })?;

        for (factory, input, output) in path {
            trace!(
                "Filter stage {} (priority {}): {} -> {}",
                factory.name,
                factory.priority,
                input,
                output
            );
            let stage = (factory.create)(&input, &output)?;
            chain.push_stage(stage)?;
        }

        debug!("Filter chain {} -> {}: [{}]", src, tgt, chain.stage_names().join(", "));
        Ok(chain)
    }

    /// Append a stage; its input must match the chain's current output
    pub fn push_stage(&mut self, stage: Box<dyn FilterStage>) -> Result<()> {
        if *stage.input_format() != self.output {
            return Err(AoutError::Format(format!(
                "stage {} expects {}, chain produces {}",
                stage.name(),
                stage.input_format(),
                self.output
            )));
        }
        self.output = *stage.output_format();
        self.stages.push(stage);
        self.hint_buffers(self.first_alloc);
        Ok(())
    }

    /// Decide per stage whether it writes in place or allocates
    ///
    /// `first_alloc` describes the buffers entering the chain: under
    /// `PassThrough` they are aliased from upstream and the first stage must
    /// allocate. Past that, a stage works in place only when it is reusable
    /// and its input and output frames have the same byte size.
    pub fn hint_buffers(&mut self, first_alloc: AllocationPolicy) {
        self.first_alloc = first_alloc;
        self.policies = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let same_frame_size =
                    stage.input_format().bytes_per_frame() == stage.output_format().bytes_per_frame();
                let aliased_input = index == 0 && first_alloc == AllocationPolicy::PassThrough;
                if stage.in_place() && same_frame_size && !aliased_input {
                    AllocationPolicy::PassThrough
                } else {
                    AllocationPolicy::Allocate {
                        bytes_per_second: stage.output_format().bytes_per_second(),
                    }
                }
            })
            .collect();
    }

    /// Run `buffer` through every stage
    ///
    /// A discontinuity resets history-keeping stages first. A stage failure
    /// discards the partial output and is returned to the caller. A buffer
    /// absorbed entirely by a stage's history comes out with zero frames.
    pub fn play(&mut self, mut buffer: AudioBuffer) -> Result<AudioBuffer> {
        if buffer.discontinuity {
            self.reset();
        }

        for (stage, policy) in self.stages.iter_mut().zip(self.policies.iter()) {
            buffer = run_stage(stage.as_mut(), *policy, buffer)?;
            if buffer.nb_samples == 0 {
                break;
            }
        }
        Ok(buffer)
    }

    /// Reset every history-keeping stage
    pub fn reset(&mut self) {
        for stage in self.stages.iter_mut().filter(|s| s.keeps_history()) {
            stage.reset();
        }
    }

    /// Input held back by every stage, e.g. a rate converter filling a chunk
    pub fn held_duration(&self) -> Mtime {
        self.stages.iter().map(|s| s.held_duration()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn policies(&self) -> &[AllocationPolicy] {
        &self.policies
    }

    pub fn input_format(&self) -> &AudioSampleFormat {
        &self.input
    }

    pub fn output_format(&self) -> &AudioSampleFormat {
        &self.output
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("stages", &self.stage_names())
            .finish()
    }
}

pub(crate) fn run_stage(
    stage: &mut dyn FilterStage,
    policy: AllocationPolicy,
    mut buffer: AudioBuffer,
) -> Result<AudioBuffer> {
    let output_format = *stage.output_format();
    let frames = stage.max_output_frames(buffer.nb_samples);
    let duration = frames_duration_ceil(frames, output_format.rate());

    match allocate(policy, duration, Some(&buffer))? {
        Allocation::InPlace => {
            stage.process_in_place(&mut buffer)?;
            Ok(buffer)
        }
        Allocation::Owned(mut output) => {
            output.discontinuity = buffer.discontinuity;
            stage.process(&buffer, &mut output)?;
            Ok(output)
        }
    }
}
