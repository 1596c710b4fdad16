use columnar_profile::pprof::{
    self, convert_from_pprof, convert_to_pprof, proto as pprof_proto,
};
use columnar_profile::{
    merge_profiles, proto, validate_profile, BinaryInfo, FunctionInfo, InlineChainInfo,
    MergeError, MergeOptions, ProfileBuilder, ProfileView, SampleInfo, SampleKeyInfo,
    SourceLineInfo, StackFrameInfo, StackId, StackInfo, ThreadInfo, ValidationOptions,
};

struct TestProfileSpec<'a> {
    process_name: &'a str,
    thread_name: &'a str,
    pid: u64,
    unit: &'a str,
    value: u64,
}

impl Default for TestProfileSpec<'_> {
    fn default() -> Self {
        TestProfileSpec {
            process_name: "app",
            thread_name: "worker-7",
            pid: 100,
            unit: "nanoseconds",
            value: 1000,
        }
    }
}

/// One sample of `value` against a two-frame user stack (work <- main).
fn build_profile(spec: &TestProfileSpec) -> proto::Profile {
    let mut builder = ProfileBuilder::new();

    let sample_type = builder.add_string("cpu").unwrap();
    builder.set_default_sample_type(sample_type);
    builder.set_hostname("host-1").unwrap();
    let unit = builder.add_string(spec.unit).unwrap();
    let value_type = builder.add_value_type(sample_type, unit).unwrap();

    let file = builder.add_string("main.c").unwrap();
    let name_main = builder.add_string("main").unwrap();
    let name_work = builder.add_string("work").unwrap();
    let func_main = builder.add_function(&FunctionInfo {
        name: name_main,
        system_name: name_main,
        filename: file,
        start_line: 1,
    });
    let func_work = builder.add_function(&FunctionInfo {
        name: name_work,
        system_name: name_work,
        filename: file,
        start_line: 10,
    });

    let build_id = builder.add_string("abc123").unwrap();
    let path = builder.add_string("/bin/app").unwrap();
    let binary = builder.add_binary(&BinaryInfo { build_id, path });

    let chain_main = builder.add_inline_chain(&InlineChainInfo {
        lines: vec![SourceLineInfo {
            function: func_main,
            line: 3,
            column: 1,
        }],
    });
    let chain_work = builder.add_inline_chain(&InlineChainInfo {
        lines: vec![SourceLineInfo {
            function: func_work,
            line: 12,
            column: 5,
        }],
    });
    let frame_main = builder.add_stack_frame(&StackFrameInfo {
        binary,
        binary_offset: 0x1000,
        inline_chain: chain_main,
    });
    let frame_work = builder.add_stack_frame(&StackFrameInfo {
        binary,
        binary_offset: 0x2000,
        inline_chain: chain_work,
    });
    let user_stack = builder.add_stack(&StackInfo {
        frames: vec![frame_work, frame_main],
    });

    let process_name = builder.add_string(spec.process_name).unwrap();
    let thread_name = builder.add_string(spec.thread_name).unwrap();
    let thread = builder.add_thread(&ThreadInfo {
        process_id: spec.pid,
        thread_id: spec.pid + 1,
        process_name,
        thread_name,
        containers: Vec::new(),
    });

    let key = builder.add_sample_key(&SampleKeyInfo {
        thread,
        user_stack,
        kernel_stack: StackId::ZERO,
        labels: Vec::new(),
    });
    builder
        .add_sample(&SampleInfo {
            key,
            timestamp: None,
            values: vec![(value_type, spec.value)],
        })
        .unwrap();

    builder.finish()
}

#[test]
fn merge_keeps_processes_by_default() {
    let a = build_profile(&TestProfileSpec {
        pid: 100,
        ..Default::default()
    });
    let b = build_profile(&TestProfileSpec {
        pid: 200,
        ..Default::default()
    });

    let merged = merge_profiles(&[a, b], MergeOptions::default()).unwrap();
    validate_profile(&merged, ValidationOptions::default()).unwrap();
    assert_eq!(merged.samples.key.len(), 2);
}

#[test]
fn merge_collapses_processes_when_disabled() {
    let a = build_profile(&TestProfileSpec {
        pid: 100,
        value: 70,
        ..Default::default()
    });
    let b = build_profile(&TestProfileSpec {
        pid: 200,
        value: 30,
        ..Default::default()
    });

    let merged = merge_profiles(
        &[a, b],
        MergeOptions {
            keep_processes: false,
            ..Default::default()
        },
    )
    .unwrap();
    validate_profile(&merged, ValidationOptions::default()).unwrap();

    assert_eq!(merged.samples.key.len(), 1);
    assert_eq!(merged.samples.values[0].value, vec![100]);
    // Process identity is gone: only the empty sentinel thread remains.
    assert_eq!(merged.threads.thread_id.len(), 1);
}

#[test]
fn merge_normalizes_well_known_time_units() {
    let nanos = build_profile(&TestProfileSpec {
        unit: "nanoseconds",
        value: 2000,
        ..Default::default()
    });
    let micros = build_profile(&TestProfileSpec {
        unit: "microseconds",
        value: 3,
        ..Default::default()
    });

    let merged = merge_profiles(&[nanos, micros], MergeOptions::default()).unwrap();
    validate_profile(&merged, ValidationOptions::default()).unwrap();

    // The first profile's unit wins and incoming values are rescaled.
    assert_eq!(merged.samples.values.len(), 1);
    assert_eq!(merged.samples.values[0].value, vec![5000]);
    assert_eq!(merged.samples.values[0].value_sum.lo, 5000);
}

#[test]
fn merge_rejects_differing_units_without_normalization() {
    let nanos = build_profile(&TestProfileSpec {
        unit: "nanoseconds",
        ..Default::default()
    });
    let micros = build_profile(&TestProfileSpec {
        unit: "microseconds",
        ..Default::default()
    });

    let result = merge_profiles(
        &[nanos, micros],
        MergeOptions {
            normalize_value_types: false,
            ..Default::default()
        },
    );
    assert!(matches!(
        result,
        Err(MergeError::IncompatibleValueTypes { .. })
    ));
}

#[test]
fn merge_rejects_feature_mismatch() {
    let a = build_profile(&TestProfileSpec::default());
    let mut b = build_profile(&TestProfileSpec::default());
    b.features.has_skewed_binary_offsets = true;

    let result = merge_profiles(&[a, b], MergeOptions::default());
    assert!(matches!(result, Err(MergeError::FeatureMismatch)));
}

#[test]
fn merge_cleans_up_thread_names() {
    let a = build_profile(&TestProfileSpec {
        thread_name: "pool-1",
        ..Default::default()
    });
    let b = build_profile(&TestProfileSpec {
        thread_name: "pool-2",
        ..Default::default()
    });

    let merged = merge_profiles(&[a, b], MergeOptions::default()).unwrap();
    validate_profile(&merged, ValidationOptions::default()).unwrap();

    let view = ProfileView::new(&merged).unwrap();
    // Both samples collapse onto one sample key once the names agree.
    assert_eq!(merged.samples.key.len(), 1);
    let names: Vec<&str> = view
        .samples()
        .map(|sample| sample.key().thread().thread_name())
        .collect();
    assert_eq!(names, vec!["pool-"]);
}

#[test]
fn merge_respects_every_option_combination() {
    let a = build_profile(&TestProfileSpec {
        pid: 100,
        ..Default::default()
    });
    let b = build_profile(&TestProfileSpec {
        pid: 200,
        thread_name: "pool-3",
        ..Default::default()
    });

    for bits in 0..64u32 {
        let options = MergeOptions {
            keep_processes: bits & 1 != 0,
            keep_binaries: bits & 2 != 0,
            keep_binary_paths: bits & 4 != 0,
            keep_timestamps: bits & 8 != 0,
            keep_line_numbers: bits & 16 != 0,
            cleanup_thread_names: bits & 32 != 0,
            ..Default::default()
        };
        let merged = merge_profiles(&[a.clone(), b.clone()], options).unwrap();
        validate_profile(&merged, ValidationOptions::default()).unwrap();
    }
}

#[test]
fn merge_label_filter_drops_labels() {
    let profile = {
        let mut builder = ProfileBuilder::new();
        let sample_type = builder.add_string("cpu").unwrap();
        builder.set_default_sample_type(sample_type);
        let unit = builder.add_string("count").unwrap();
        let value_type = builder.add_value_type(sample_type, unit).unwrap();

        let keep_key = builder.add_string("build").unwrap();
        let keep_value = builder.add_string("release").unwrap();
        let keep = builder.add_string_label(&columnar_profile::StringLabelInfo {
            key: keep_key,
            value: keep_value,
        });
        let drop_key = builder.add_string("trace_id").unwrap();
        let drop = builder.add_numeric_label(&columnar_profile::NumberLabelInfo {
            key: drop_key,
            value: 98765,
        });

        let key = builder.add_sample_key(&SampleKeyInfo {
            labels: vec![keep, drop],
            ..Default::default()
        });
        builder
            .add_sample(&SampleInfo {
                key,
                timestamp: None,
                values: vec![(value_type, 1)],
            })
            .unwrap();
        builder.finish()
    };

    let merged = merge_profiles(
        &[profile],
        MergeOptions {
            label_filter: Some(Box::new(|label: columnar_profile::LabelRef<'_>| {
                label.key() != "trace_id"
            })),
            ..Default::default()
        },
    )
    .unwrap();
    validate_profile(&merged, ValidationOptions::default()).unwrap();

    let view = ProfileView::new(&merged).unwrap();
    let sample = view.samples().next().unwrap();
    let keys: Vec<&str> = sample.key().labels().map(|label| label.key()).collect();
    assert_eq!(keys, vec!["build"]);
}

#[test]
fn validator_rejects_tampered_profiles() {
    let good = build_profile(&TestProfileSpec::default());
    validate_profile(&good, ValidationOptions::default()).unwrap();

    // Out-of-range stack frame index.
    let mut broken = good.clone();
    broken.stacks.frame_id[0] = 10_000;
    assert!(validate_profile(&broken, ValidationOptions::default()).is_err());

    // Incongruent columns.
    let mut broken = good.clone();
    broken.functions.start_line.pop();
    assert!(validate_profile(&broken, ValidationOptions::default()).is_err());

    // Non-monotonic offsets.
    let mut broken = good.clone();
    broken.stacks.offset[1] = 5;
    broken.stacks.offset.push(2);
    assert!(validate_profile(&broken, ValidationOptions::default()).is_err());

    // Clobbered empty-string sentinel.
    let mut broken = good;
    broken.strtab.length[0] = 1;
    assert!(validate_profile(&broken, ValidationOptions::default()).is_err());
}

/// Builds the pprof fixture of the round-trip tests: one kernel frame and
/// one userspace frame, plus thread-identity labels.
fn build_pprof_fixture() -> pprof_proto::Profile {
    let strings = vec![
        "".to_string(),             // 0
        "cpu".to_string(),          // 1
        "count".to_string(),        // 2
        "[kernel]".to_string(),     // 3
        "/bin/x".to_string(),       // 4
        "kfunc".to_string(),        // 5
        "ufunc".to_string(),        // 6
        "kernel-build".to_string(), // 7
        "x-build".to_string(),      // 8
        "pid".to_string(),          // 9
        "thread_comm".to_string(),  // 10
        "worker".to_string(),       // 11
        "env".to_string(),          // 12
        "prod".to_string(),         // 13
    ];

    pprof_proto::Profile {
        string_table: strings,
        sample_type: vec![pprof_proto::ValueType { r#type: 1, unit: 2 }],
        default_sample_type: 1,
        mapping: vec![
            pprof_proto::Mapping {
                id: 1,
                filename: 3,
                build_id: 7,
                memory_start: 0x1000,
                memory_limit: 0x10000,
                file_offset: 0,
                ..Default::default()
            },
            pprof_proto::Mapping {
                id: 2,
                filename: 4,
                build_id: 8,
                memory_start: 0x400000,
                memory_limit: 0x500000,
                file_offset: 0,
                ..Default::default()
            },
        ],
        function: vec![
            pprof_proto::Function {
                id: 1,
                name: 5,
                system_name: 5,
                filename: 0,
                start_line: 0,
            },
            pprof_proto::Function {
                id: 2,
                name: 6,
                system_name: 6,
                filename: 0,
                start_line: 0,
            },
        ],
        location: vec![
            pprof_proto::Location {
                id: 1,
                mapping_id: 1,
                address: 0x1480,
                line: vec![pprof_proto::Line {
                    function_id: 1,
                    line: 42,
                    column: 0,
                }],
                ..Default::default()
            },
            pprof_proto::Location {
                id: 2,
                mapping_id: 2,
                address: 0x401000,
                line: vec![pprof_proto::Line {
                    function_id: 2,
                    line: 7,
                    column: 0,
                }],
                ..Default::default()
            },
        ],
        sample: vec![pprof_proto::Sample {
            location_id: vec![1, 2],
            value: vec![5],
            label: vec![
                pprof_proto::Label {
                    key: 9,
                    num: 4242,
                    ..Default::default()
                },
                pprof_proto::Label {
                    key: 10,
                    str: 11,
                    ..Default::default()
                },
                pprof_proto::Label {
                    key: 12,
                    str: 13,
                    ..Default::default()
                },
            ],
        }],
        ..Default::default()
    }
}

fn stack_function_names(profile: &pprof_proto::Profile, sample: &pprof_proto::Sample) -> Vec<String> {
    let mut names = Vec::new();
    for location_id in &sample.location_id {
        let location = profile
            .location
            .iter()
            .find(|l| l.id == *location_id)
            .unwrap();
        for line in &location.line {
            let function = profile
                .function
                .iter()
                .find(|f| f.id == line.function_id)
                .unwrap();
            names.push(profile.string_table[function.name as usize].clone());
        }
    }
    names
}

#[test]
fn pprof_kernel_locations_split_onto_kernel_stack() {
    let fixture = build_pprof_fixture();
    let converted = convert_from_pprof(&fixture).unwrap();
    validate_profile(&converted, ValidationOptions::default()).unwrap();

    let view = ProfileView::new(&converted).unwrap();
    let sample = view.samples().next().unwrap();

    let kernel: Vec<&str> = sample
        .key()
        .kernel_stack()
        .frames()
        .flat_map(|frame| {
            frame
                .inline_chain()
                .lines()
                .map(|line| line.function().name())
                .collect::<Vec<_>>()
        })
        .collect();
    let user: Vec<&str> = sample
        .key()
        .user_stack()
        .frames()
        .flat_map(|frame| {
            frame
                .inline_chain()
                .lines()
                .map(|line| line.function().name())
                .collect::<Vec<_>>()
        })
        .collect();

    assert_eq!(kernel, vec!["kfunc"]);
    assert_eq!(user, vec!["ufunc"]);
}

#[test]
fn pprof_thread_identity_labels_are_lifted() {
    let fixture = build_pprof_fixture();
    let converted = convert_from_pprof(&fixture).unwrap();

    let view = ProfileView::new(&converted).unwrap();
    let sample = view.samples().next().unwrap();
    let thread = sample.key().thread();

    assert_eq!(thread.process_id(), 4242);
    assert_eq!(thread.thread_name(), "worker");

    // Identity keys leave the label bag; other labels stay.
    let label_keys: Vec<&str> = sample.key().labels().map(|label| label.key()).collect();
    assert_eq!(label_keys, vec!["env"]);
}

#[test]
fn pprof_round_trip_preserves_values_and_symbolic_stacks() {
    let fixture = build_pprof_fixture();
    let converted = convert_from_pprof(&fixture).unwrap();
    let back = convert_to_pprof(&converted).unwrap();

    assert_eq!(back.sample.len(), fixture.sample.len());
    for (old, new) in fixture.sample.iter().zip(back.sample.iter()) {
        assert_eq!(old.value, new.value);
        assert_eq!(
            stack_function_names(&fixture, old),
            stack_function_names(&back, new)
        );
    }

    // The default sample type string survives.
    let old_default = &fixture.string_table[fixture.default_sample_type as usize];
    let new_default = &back.string_table[back.default_sample_type as usize];
    assert_eq!(old_default, new_default);

    // A second round trip is stable even though addresses are synthetic.
    let converted_again = convert_from_pprof(&back).unwrap();
    let back_again = convert_to_pprof(&converted_again).unwrap();
    for (a, b) in back.sample.iter().zip(back_again.sample.iter()) {
        assert_eq!(
            stack_function_names(&back, a),
            stack_function_names(&back_again, b)
        );
    }
}

#[test]
fn pprof_rejects_mixed_kernel_user_stacks() {
    let mut fixture = build_pprof_fixture();
    // User frame before a kernel frame is malformed.
    fixture.sample[0].location_id = vec![2, 1];
    let result = convert_from_pprof(&fixture);
    assert!(matches!(
        result,
        Err(pprof::PprofConvertError::MixedKernelUserStack)
    ));
}

#[test]
fn wire_round_trip_through_prost() {
    use prost::Message;

    let profile = build_profile(&TestProfileSpec::default());
    let bytes = profile.encode_to_vec();
    let decoded = proto::Profile::decode(&bytes[..]).unwrap();
    assert_eq!(profile, decoded);
    validate_profile(&decoded, ValidationOptions::default()).unwrap();
}
