//! Structural validation of wire profiles.
//!
//! A profile is accepted iff congruent columns have identical lengths,
//! every offset array is monotonic non-decreasing, flattened-array offsets
//! never exceed the flattened value array length, the empty sentinel rows
//! are in place, and (optionally) every entity index is in range.

use thiserror::Error;

use crate::proto;

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("columns of {table} are not congruent: expected {expected} rows, got {got}")]
    CongruenceMismatch {
        table: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("table {0} is missing its empty sentinel row")]
    MissingSentinel(&'static str),

    #[error("offset array of {0} is not monotonic non-decreasing")]
    NonMonotonicOffsets(&'static str),

    #[error("offset array of {0} points past the flattened array")]
    OffsetOutOfRange(&'static str),

    #[error("{entity} index {index} out of range [0, {size})")]
    IndexOutOfRange {
        entity: &'static str,
        index: u32,
        size: usize,
    },

    #[error("string {0} extends past the string blob")]
    StringRangeOverflow(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    /// Check that every entity index is in range. Cheap structural checks
    /// run regardless.
    pub check_indices: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        ValidationOptions {
            check_indices: true,
        }
    }
}

pub fn validate_profile(
    profile: &proto::Profile,
    options: ValidationOptions,
) -> Result<(), ValidationError> {
    let validator = ProfileValidator { profile, options };
    validator.validate()
}

struct ProfileValidator<'a> {
    profile: &'a proto::Profile,
    options: ValidationOptions,
}

impl<'a> ProfileValidator<'a> {
    fn validate(&self) -> Result<(), ValidationError> {
        self.check_string_table()?;
        self.check_comments()?;
        self.check_labels()?;
        self.check_threads()?;
        self.check_binaries()?;
        self.check_functions()?;
        self.check_inline_chains()?;
        self.check_stack_frames()?;
        self.check_stacks()?;
        self.check_sample_keys()?;
        self.check_samples()?;
        Ok(())
    }

    fn check_string_table(&self) -> Result<(), ValidationError> {
        let strtab = &self.profile.strtab;
        require_congruent("strtab", strtab.offset.len(), strtab.length.len())?;
        if strtab.length.is_empty() || strtab.length[0] != 0 {
            return Err(ValidationError::MissingSentinel("strtab"));
        }
        self.require_monotonic("strtab", &strtab.offset)?;

        for (i, (offset, length)) in strtab.offset.iter().zip(strtab.length.iter()).enumerate() {
            if *offset as usize + *length as usize > strtab.strings.len() {
                return Err(ValidationError::StringRangeOverflow(i as u32));
            }
        }
        Ok(())
    }

    fn check_comments(&self) -> Result<(), ValidationError> {
        self.require_string_array("comments", &self.profile.comments.comment)
    }

    fn check_labels(&self) -> Result<(), ValidationError> {
        let labels = &self.profile.labels;
        require_congruent(
            "labels.strings",
            labels.strings.key.len(),
            labels.strings.value.len(),
        )?;
        self.require_string_array("labels.strings.key", &labels.strings.key)?;
        self.require_string_array("labels.strings.value", &labels.strings.value)?;

        require_congruent(
            "labels.numbers",
            labels.numbers.key.len(),
            labels.numbers.value.len(),
        )?;
        self.require_string_array("labels.numbers.key", &labels.numbers.key)?;
        Ok(())
    }

    fn check_threads(&self) -> Result<(), ValidationError> {
        let threads = &self.profile.threads;
        require_congruent("threads", threads.thread_id.len(), threads.process_id.len())?;
        require_congruent("threads", threads.thread_id.len(), threads.thread_name.len())?;
        require_congruent("threads", threads.thread_id.len(), threads.process_name.len())?;
        require_congruent(
            "threads",
            threads.thread_id.len(),
            threads.container_offset.len(),
        )?;

        let sentinel_ok = !threads.thread_id.is_empty()
            && threads.thread_id[0] == 0
            && threads.process_id[0] == 0
            && threads.thread_name[0] == 0
            && threads.process_name[0] == 0
            && threads.container_offset[0] == 0
            && (threads.container_offset.len() == 1 || threads.container_offset[1] == 0);
        if !sentinel_ok {
            return Err(ValidationError::MissingSentinel("threads"));
        }

        self.require_string_array("threads.thread_name", &threads.thread_name)?;
        self.require_string_array("threads.process_name", &threads.process_name)?;
        self.require_flattened_array(
            "threads.container_offset",
            &threads.container_offset,
            threads.container_names.len(),
        )?;
        self.require_string_array("threads.container_names", &threads.container_names)?;
        Ok(())
    }

    fn check_binaries(&self) -> Result<(), ValidationError> {
        let binaries = &self.profile.binaries;
        require_congruent("binaries", binaries.build_id.len(), binaries.path.len())?;
        self.require_string_array("binaries.build_id", &binaries.build_id)?;
        self.require_string_array("binaries.path", &binaries.path)?;

        if binaries.build_id.is_empty() || binaries.build_id[0] != 0 || binaries.path[0] != 0 {
            return Err(ValidationError::MissingSentinel("binaries"));
        }
        Ok(())
    }

    fn check_functions(&self) -> Result<(), ValidationError> {
        let functions = &self.profile.functions;
        require_congruent("functions", functions.name.len(), functions.system_name.len())?;
        require_congruent("functions", functions.name.len(), functions.filename.len())?;
        require_congruent("functions", functions.name.len(), functions.start_line.len())?;
        self.require_string_array("functions.name", &functions.name)?;
        self.require_string_array("functions.system_name", &functions.system_name)?;
        self.require_string_array("functions.filename", &functions.filename)?;

        let sentinel_ok = !functions.name.is_empty()
            && functions.name[0] == 0
            && functions.system_name[0] == 0
            && functions.filename[0] == 0
            && functions.start_line[0] == 0;
        if !sentinel_ok {
            return Err(ValidationError::MissingSentinel("functions"));
        }
        Ok(())
    }

    fn check_inline_chains(&self) -> Result<(), ValidationError> {
        let chains = &self.profile.inline_chains;
        self.require_flattened_array(
            "inline_chains.offset",
            &chains.offset,
            chains.function_id.len(),
        )?;
        require_congruent(
            "inline_chains",
            chains.function_id.len(),
            chains.line.len(),
        )?;
        require_congruent(
            "inline_chains",
            chains.function_id.len(),
            chains.column.len(),
        )?;
        self.require_entity_array(
            "function",
            &chains.function_id,
            self.profile.functions.name.len(),
        )?;

        let sentinel_ok = !chains.offset.is_empty()
            && chains.offset[0] == 0
            && (chains.offset.len() == 1 || chains.offset[1] == 0);
        if !sentinel_ok {
            return Err(ValidationError::MissingSentinel("inline_chains"));
        }
        Ok(())
    }

    fn check_stack_frames(&self) -> Result<(), ValidationError> {
        let frames = &self.profile.stack_frames;
        require_congruent(
            "stack_frames",
            frames.binary_id.len(),
            frames.binary_offset.len(),
        )?;
        require_congruent(
            "stack_frames",
            frames.binary_id.len(),
            frames.inline_chain_id.len(),
        )?;

        let sentinel_ok = !frames.binary_id.is_empty()
            && frames.binary_id[0] == 0
            && frames.binary_offset[0] == 0
            && frames.inline_chain_id[0] == 0;
        if !sentinel_ok {
            return Err(ValidationError::MissingSentinel("stack_frames"));
        }

        self.require_entity_array(
            "binary",
            &frames.binary_id,
            self.profile.binaries.build_id.len(),
        )?;
        self.require_entity_array(
            "inline_chain",
            &frames.inline_chain_id,
            self.profile.inline_chains.offset.len(),
        )?;
        Ok(())
    }

    fn check_stacks(&self) -> Result<(), ValidationError> {
        let stacks = &self.profile.stacks;
        self.require_flattened_array("stacks.offset", &stacks.offset, stacks.frame_id.len())?;
        self.require_entity_array(
            "stack_frame",
            &stacks.frame_id,
            self.profile.stack_frames.binary_id.len(),
        )?;

        // The first stack must be defined empty.
        let sentinel_ok = !stacks.offset.is_empty()
            && stacks.offset[0] == 0
            && (stacks.offset.len() == 1 || stacks.offset[1] == 0);
        if !sentinel_ok {
            return Err(ValidationError::MissingSentinel("stacks"));
        }
        Ok(())
    }

    fn check_sample_keys(&self) -> Result<(), ValidationError> {
        let keys = &self.profile.sample_keys;
        require_congruent(
            "sample_keys",
            keys.thread_id.len(),
            keys.user_stack_id.len(),
        )?;
        require_congruent(
            "sample_keys",
            keys.thread_id.len(),
            keys.kernel_stack_id.len(),
        )?;
        require_congruent(
            "sample_keys",
            keys.thread_id.len(),
            keys.first_label_id.len(),
        )?;

        self.require_flattened_array(
            "sample_keys.first_label_id",
            &keys.first_label_id,
            keys.packed_label_id.len(),
        )?;
        self.require_entity_array(
            "stack",
            &keys.user_stack_id,
            self.profile.stacks.offset.len(),
        )?;
        self.require_entity_array(
            "stack",
            &keys.kernel_stack_id,
            self.profile.stacks.offset.len(),
        )?;
        self.require_entity_array(
            "thread",
            &keys.thread_id,
            self.profile.threads.thread_id.len(),
        )?;

        // Packed labels need a custom check: the low bit selects the table.
        if self.options.check_indices {
            for packed in &keys.packed_label_id {
                let is_number = packed & 1 == 1;
                let position = (packed >> 1) as usize;
                let size = if is_number {
                    self.profile.labels.numbers.key.len()
                } else {
                    self.profile.labels.strings.key.len()
                };
                if position >= size {
                    return Err(ValidationError::IndexOutOfRange {
                        entity: "label",
                        index: *packed,
                        size,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_samples(&self) -> Result<(), ValidationError> {
        let samples = &self.profile.samples;
        for column in &samples.values {
            require_congruent("samples.values", samples.key.len(), column.value.len())?;
        }
        if let Some(timestamps) = &samples.timestamps {
            require_congruent(
                "samples.timestamps",
                samples.key.len(),
                timestamps.delta_nanoseconds.len(),
            )?;
        }

        self.require_entity_array(
            "sample_key",
            &samples.key,
            self.profile.sample_keys.thread_id.len(),
        )?;
        Ok(())
    }

    fn require_monotonic(&self, table: &'static str, offsets: &[u32]) -> Result<(), ValidationError> {
        if offsets.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(ValidationError::NonMonotonicOffsets(table));
        }
        Ok(())
    }

    fn require_flattened_array(
        &self,
        table: &'static str,
        offsets: &[u32],
        values_len: usize,
    ) -> Result<(), ValidationError> {
        self.require_monotonic(table, offsets)?;
        if offsets.iter().any(|offset| *offset as usize > values_len) {
            return Err(ValidationError::OffsetOutOfRange(table));
        }
        Ok(())
    }

    fn require_string_array(
        &self,
        table: &'static str,
        indices: &[u32],
    ) -> Result<(), ValidationError> {
        self.require_entity_array(table, indices, self.profile.strtab.length.len())
    }

    fn require_entity_array(
        &self,
        entity: &'static str,
        indices: &[u32],
        size: usize,
    ) -> Result<(), ValidationError> {
        if !self.options.check_indices {
            return Ok(());
        }
        for index in indices {
            if *index as usize >= size {
                return Err(ValidationError::IndexOutOfRange {
                    entity,
                    index: *index,
                    size,
                });
            }
        }
        Ok(())
    }
}

fn require_congruent(
    table: &'static str,
    expected: usize,
    got: usize,
) -> Result<(), ValidationError> {
    if expected != got {
        return Err(ValidationError::CongruenceMismatch {
            table,
            expected,
            got,
        });
    }
    Ok(())
}
