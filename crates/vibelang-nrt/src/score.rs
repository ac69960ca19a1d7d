//! SuperCollider score files for NRT rendering.
//!
//! Converts a command stream into OSC bundles and writes them in the binary
//! format `scsynth -N` reads:
//! - For each bundle: 4-byte big-endian length prefix + encoded OSC bundle
//! - No trailing marker; the `/none` bundle sets the render length

use anyhow::{anyhow, Context, Result};
use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::command::{Command, CommandBundle, ControlArg};
use crate::protocol::{AddAction, CalculationRate};

/// A bundle with its absolute time in seconds.
#[derive(Debug, Clone)]
pub struct ScoredEvent {
    /// Time in seconds from the start of the score.
    pub time_seconds: f64,
    /// The OSC bundle.
    pub packet: OscPacket,
}

/// Accumulates timed bundles and writes them as a score file.
#[derive(Debug, Default)]
pub struct ScoreWriter {
    /// Accumulated events.
    pub events: Vec<ScoredEvent>,
}

impl ScoreWriter {
    /// Create a new empty score writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one command bundle.
    pub fn add_bundle(&mut self, bundle: &CommandBundle) {
        let content = bundle
            .commands
            .iter()
            .flat_map(command_to_messages)
            .map(OscPacket::Message)
            .collect();
        self.events.push(ScoredEvent {
            time_seconds: bundle.offset,
            packet: OscPacket::Bundle(OscBundle {
                timetag: seconds_to_osc_time(bundle.offset),
                content,
            }),
        });
    }

    /// Add a whole command stream.
    pub fn add_stream(&mut self, stream: &[CommandBundle]) {
        for bundle in stream {
            self.add_bundle(bundle);
        }
    }

    /// Get the total duration of the score in seconds.
    pub fn duration(&self) -> f64 {
        self.events
            .iter()
            .map(|e| e.time_seconds)
            .fold(0.0, f64::max)
    }

    /// Get the number of events in the score.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Sort events by time and write them, length-prefixed, to `writer`.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<()> {
        self.events
            .sort_by(|a, b| a.time_seconds.total_cmp(&b.time_seconds));

        for event in &self.events {
            let encoded = encoder::encode(&event.packet)
                .map_err(|e| anyhow!("Failed to encode bundle at {}s: {}", event.time_seconds, e))?;
            let len = encoded.len() as i32;
            writer
                .write_all(&len.to_be_bytes())
                .context("Failed to write bundle length")?;
            writer
                .write_all(&encoded)
                .context("Failed to write bundle")?;
        }
        Ok(())
    }

    /// Write the score to a file.
    pub fn write_to_file(&mut self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create score file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush().context("Failed to flush score file")?;
        log::info!(
            "[SCORE] Wrote {} bundles ({:.3}s) to {}",
            self.events.len(),
            self.duration(),
            path.display()
        );
        Ok(())
    }
}

/// Convert a command stream into OSC bundles.
pub fn bundles(stream: &[CommandBundle]) -> Vec<OscBundle> {
    stream
        .iter()
        .map(|bundle| OscBundle {
            timetag: seconds_to_osc_time(bundle.offset),
            content: bundle
                .commands
                .iter()
                .flat_map(command_to_messages)
                .map(OscPacket::Message)
                .collect(),
        })
        .collect()
}

/// A frame count, where `-1` means "through the end".
fn frames(count: Option<u32>) -> OscType {
    OscType::Int(count.map_or(-1, |count| count as i32))
}

fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

/// Encode one command as the scsynth messages it stands for.
pub fn command_to_messages(command: &Command) -> Vec<OscMessage> {
    match command {
        Command::DefinitionReceive { definitions } => definitions
            .iter()
            .map(|definition| message("/d_recv", vec![OscType::Blob(definition.bytes.clone())]))
            .collect(),
        Command::BufferAllocate {
            buffer,
            frame_count,
            channel_count,
        } => vec![message(
            "/b_alloc",
            vec![
                OscType::Int(buffer.as_i32()),
                OscType::Int(*frame_count as i32),
                OscType::Int(*channel_count as i32),
            ],
        )],
        Command::BufferAllocateRead {
            buffer,
            path,
            starting_frame,
            frame_count,
        } => vec![message(
            "/b_allocRead",
            vec![
                OscType::Int(buffer.as_i32()),
                OscType::String(path.to_string_lossy().into_owned()),
                OscType::Int(*starting_frame as i32),
                OscType::Int(*frame_count as i32),
            ],
        )],
        Command::BufferRead {
            buffer,
            path,
            channels,
            starting_frame_in_file,
            frame_count,
            starting_frame_in_buffer,
            leave_open,
        } => {
            let mut args = vec![
                OscType::Int(buffer.as_i32()),
                OscType::String(path.to_string_lossy().into_owned()),
                OscType::Int(*starting_frame_in_file as i32),
                frames(*frame_count),
                OscType::Int(*starting_frame_in_buffer as i32),
                OscType::Int(i32::from(*leave_open)),
            ];
            let addr = match channels {
                Some(channels) => {
                    args.extend(channels.iter().map(|channel| OscType::Int(*channel as i32)));
                    "/b_readChannel"
                }
                None => "/b_read",
            };
            vec![message(addr, args)]
        }
        Command::BufferZero { buffer } => {
            vec![message("/b_zero", vec![OscType::Int(buffer.as_i32())])]
        }
        Command::BufferFill { buffer, triples } => {
            let mut args = vec![OscType::Int(buffer.as_i32())];
            for (index, count, value) in triples {
                args.push(OscType::Int(*index as i32));
                args.push(OscType::Int(*count as i32));
                args.push(OscType::Float(*value as f32));
            }
            vec![message("/b_fill", args)]
        }
        Command::BufferGenerate {
            buffer,
            generator,
            normalize,
            as_wavetable,
            clear_first,
        } => {
            let flags = i32::from(*normalize) + 2 * i32::from(*as_wavetable) + 4 * i32::from(*clear_first);
            let mut args = vec![
                OscType::Int(buffer.as_i32()),
                OscType::String(generator.command_name().to_string()),
                OscType::Int(flags),
            ];
            args.extend(
                generator
                    .coefficients()
                    .into_iter()
                    .map(|value| OscType::Float(value as f32)),
            );
            vec![message("/b_gen", args)]
        }
        Command::BufferSet { buffer, pairs } => {
            let mut args = vec![OscType::Int(buffer.as_i32())];
            for (index, value) in pairs {
                args.push(OscType::Int(*index as i32));
                args.push(OscType::Float(*value as f32));
            }
            vec![message("/b_set", args)]
        }
        Command::BufferSetContiguous { buffer, runs } => {
            let mut args = vec![OscType::Int(buffer.as_i32())];
            for (index, values) in runs.iter().filter(|(_, values)| !values.is_empty()) {
                args.push(OscType::Int(*index as i32));
                args.push(OscType::Int(values.len() as i32));
                args.extend(values.iter().map(|value| OscType::Float(*value as f32)));
            }
            vec![message("/b_setn", args)]
        }
        Command::BufferNormalize {
            buffer,
            new_maximum,
            as_wavetable,
        } => {
            let command = if *as_wavetable { "wnormalize" } else { "normalize" };
            vec![message(
                "/b_gen",
                vec![
                    OscType::Int(buffer.as_i32()),
                    OscType::String(command.to_string()),
                    OscType::Float(*new_maximum as f32),
                ],
            )]
        }
        Command::BufferCopy {
            source,
            target,
            source_starting_frame,
            target_starting_frame,
            frame_count,
        } => vec![message(
            "/b_gen",
            vec![
                OscType::Int(target.as_i32()),
                OscType::String("copy".to_string()),
                OscType::Int(*target_starting_frame as i32),
                OscType::Int(source.as_i32()),
                OscType::Int(*source_starting_frame as i32),
                frames(*frame_count),
            ],
        )],
        Command::BufferWrite {
            buffer,
            path,
            header_format,
            sample_format,
            frame_count,
            starting_frame,
            leave_open,
        } => vec![message(
            "/b_write",
            vec![
                OscType::Int(buffer.as_i32()),
                OscType::String(path.to_string_lossy().into_owned()),
                OscType::String(header_format.as_str().to_string()),
                OscType::String(sample_format.as_str().to_string()),
                frames(*frame_count),
                OscType::Int(*starting_frame as i32),
                OscType::Int(i32::from(*leave_open)),
            ],
        )],
        Command::BufferClose { buffer } => {
            vec![message("/b_close", vec![OscType::Int(buffer.as_i32())])]
        }
        Command::NodeCreate {
            node,
            definition: Some(definition),
            action,
            target,
            controls,
        } => {
            let mut args = vec![
                OscType::String(definition.clone()),
                OscType::Int(node.as_i32()),
                OscType::Int(i32::from(*action)),
                OscType::Int(target.as_i32()),
            ];
            for (name, value) in controls {
                args.push(OscType::String(name.clone()));
                args.push(match value {
                    ControlArg::Number(number) => OscType::Float(*number as f32),
                    ControlArg::Bus { rate, index } => {
                        OscType::String(format!("{}{}", rate.map_prefix(), index))
                    }
                });
            }
            vec![message("/s_new", args)]
        }
        Command::NodeCreate {
            node,
            definition: None,
            action,
            target,
            ..
        } => vec![message(
            "/g_new",
            vec![
                OscType::Int(node.as_i32()),
                OscType::Int(i32::from(*action)),
                OscType::Int(target.as_i32()),
            ],
        )],
        Command::NodeMove {
            node,
            action,
            target,
        } => {
            let (node, target) = (OscType::Int(node.as_i32()), OscType::Int(target.as_i32()));
            vec![match action {
                AddAction::AddToHead => message("/g_head", vec![target, node]),
                AddAction::AddToTail => message("/g_tail", vec![target, node]),
                AddAction::AddBefore => message("/n_before", vec![node, target]),
                AddAction::AddAfter => message("/n_after", vec![node, target]),
            }]
        }
        Command::NodeSet { node, controls } => {
            let mut args = vec![OscType::Int(node.as_i32())];
            for (name, value) in controls {
                args.push(OscType::String(name.clone()));
                args.push(OscType::Float(*value as f32));
            }
            vec![message("/n_set", args)]
        }
        Command::NodeMapToBus {
            node,
            rate,
            mappings,
        } => {
            let addr = match rate {
                CalculationRate::Audio => "/n_mapa",
                CalculationRate::Control => "/n_map",
            };
            let mut args = vec![OscType::Int(node.as_i32())];
            for (name, index) in mappings {
                args.push(OscType::String(name.clone()));
                args.push(OscType::Int(*index));
            }
            vec![message(addr, args)]
        }
        Command::BusSet { pairs } => {
            let mut args = Vec::with_capacity(pairs.len() * 2);
            for (index, value) in pairs {
                args.push(OscType::Int(*index));
                args.push(OscType::Float(*value as f32));
            }
            vec![message("/c_set", args)]
        }
        Command::NodeFree { nodes } => vec![message(
            "/n_free",
            nodes.iter().map(|node| OscType::Int(node.as_i32())).collect(),
        )],
        Command::BufferFree { buffer } => {
            vec![message("/b_free", vec![OscType::Int(buffer.as_i32())])]
        }
        Command::EndOfScore => vec![message("/none", Vec::new())],
    }
}

/// Convert seconds to OSC NTP timetag.
///
/// For score files, we use relative times from the start of the score.
pub fn seconds_to_osc_time(seconds: f64) -> OscTime {
    // Use 1 as the base to avoid the "immediately" special case (0,1)
    let secs = 1 + seconds.floor() as u32;
    let frac = ((seconds - seconds.floor()) * (u32::MAX as f64)) as u32;
    OscTime::from((secs, frac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Generator, HeaderFormat, SampleFormat};
    use crate::protocol::{BufNum, NodeId};

    fn stream() -> Vec<CommandBundle> {
        vec![
            CommandBundle {
                offset: 0.0,
                commands: vec![
                    Command::NodeCreate {
                        node: NodeId(1000),
                        definition: None,
                        action: AddAction::AddToHead,
                        target: NodeId(0),
                        controls: Vec::new(),
                    },
                    Command::NodeCreate {
                        node: NodeId(1001),
                        definition: Some("sine".to_string()),
                        action: AddAction::AddToTail,
                        target: NodeId(1000),
                        controls: vec![
                            ("freq".to_string(), ControlArg::Number(440.0)),
                            (
                                "amp".to_string(),
                                ControlArg::Bus {
                                    rate: CalculationRate::Control,
                                    index: 3,
                                },
                            ),
                        ],
                    },
                ],
            },
            CommandBundle {
                offset: 1.5,
                commands: vec![
                    Command::NodeFree {
                        nodes: vec![NodeId(1000), NodeId(1001)],
                    },
                    Command::EndOfScore,
                ],
            },
        ]
    }

    #[test]
    fn test_score_writer_new() {
        let score = ScoreWriter::new();
        assert_eq!(score.event_count(), 0);
        assert_eq!(score.duration(), 0.0);
    }

    #[test]
    fn test_node_messages() {
        let bundles = bundles(&stream());
        assert_eq!(bundles.len(), 2);
        let OscPacket::Message(s_new) = &bundles[0].content[1] else {
            panic!("expected a message");
        };
        assert_eq!(s_new.addr, "/s_new");
        assert_eq!(
            s_new.args,
            vec![
                OscType::String("sine".to_string()),
                OscType::Int(1001),
                OscType::Int(1),
                OscType::Int(1000),
                OscType::String("freq".to_string()),
                OscType::Float(440.0),
                OscType::String("amp".to_string()),
                OscType::String("c3".to_string()),
            ]
        );
        let addrs: Vec<String> = bundles[1]
            .content
            .iter()
            .filter_map(|p| match p {
                OscPacket::Message(m) => Some(m.addr.clone()),
                OscPacket::Bundle(_) => None,
            })
            .collect();
        assert_eq!(addrs, vec!["/n_free", "/none"]);
    }

    #[test]
    fn test_move_messages() {
        let moves = [
            (AddAction::AddToHead, "/g_head", vec![OscType::Int(2), OscType::Int(1)]),
            (AddAction::AddToTail, "/g_tail", vec![OscType::Int(2), OscType::Int(1)]),
            (AddAction::AddBefore, "/n_before", vec![OscType::Int(1), OscType::Int(2)]),
            (AddAction::AddAfter, "/n_after", vec![OscType::Int(1), OscType::Int(2)]),
        ];
        for (action, addr, args) in moves {
            let messages = command_to_messages(&Command::NodeMove {
                node: NodeId(1),
                action,
                target: NodeId(2),
            });
            assert_eq!(messages, vec![message(addr, args)]);
        }
    }

    #[test]
    fn test_buffer_and_bus_messages() {
        let messages = command_to_messages(&Command::BufferAllocate {
            buffer: BufNum(4),
            frame_count: 1024,
            channel_count: 2,
        });
        assert_eq!(messages[0].addr, "/b_alloc");
        assert_eq!(
            messages[0].args,
            vec![OscType::Int(4), OscType::Int(1024), OscType::Int(2)]
        );

        let messages = command_to_messages(&Command::NodeMapToBus {
            node: NodeId(1000),
            rate: CalculationRate::Audio,
            mappings: vec![("in".to_string(), 16)],
        });
        assert_eq!(messages[0].addr, "/n_mapa");

        let messages = command_to_messages(&Command::BusSet {
            pairs: vec![(0, 0.5), (2, 1.0)],
        });
        assert_eq!(
            messages[0].args,
            vec![
                OscType::Int(0),
                OscType::Float(0.5),
                OscType::Int(2),
                OscType::Float(1.0)
            ]
        );
    }

    #[test]
    fn test_buffer_operation_messages() {
        let messages = command_to_messages(&Command::BufferRead {
            buffer: BufNum(1),
            path: "loop.wav".into(),
            channels: Some(vec![0, 1]),
            starting_frame_in_file: 10,
            frame_count: None,
            starting_frame_in_buffer: 0,
            leave_open: true,
        });
        assert_eq!(messages[0].addr, "/b_readChannel");
        assert_eq!(
            messages[0].args,
            vec![
                OscType::Int(1),
                OscType::String("loop.wav".to_string()),
                OscType::Int(10),
                OscType::Int(-1),
                OscType::Int(0),
                OscType::Int(1),
                OscType::Int(0),
                OscType::Int(1),
            ]
        );

        let messages = command_to_messages(&Command::BufferGenerate {
            buffer: BufNum(2),
            generator: Generator::Sine2 {
                frequencies: vec![1.0, 3.0],
                amplitudes: vec![1.0, 0.5],
            },
            normalize: true,
            as_wavetable: true,
            clear_first: false,
        });
        assert_eq!(
            messages[0].args,
            vec![
                OscType::Int(2),
                OscType::String("sine2".to_string()),
                OscType::Int(3),
                OscType::Float(1.0),
                OscType::Float(1.0),
                OscType::Float(3.0),
                OscType::Float(0.5),
            ]
        );

        let messages = command_to_messages(&Command::BufferCopy {
            source: BufNum(0),
            target: BufNum(3),
            source_starting_frame: 4,
            target_starting_frame: 8,
            frame_count: Some(16),
        });
        assert_eq!(messages[0].addr, "/b_gen");
        assert_eq!(
            messages[0].args,
            vec![
                OscType::Int(3),
                OscType::String("copy".to_string()),
                OscType::Int(8),
                OscType::Int(0),
                OscType::Int(4),
                OscType::Int(16),
            ]
        );

        let messages = command_to_messages(&Command::BufferSetContiguous {
            buffer: BufNum(0),
            runs: vec![(0, vec![0.5, 0.25]), (8, Vec::new())],
        });
        assert_eq!(
            messages[0].args,
            vec![
                OscType::Int(0),
                OscType::Int(0),
                OscType::Int(2),
                OscType::Float(0.5),
                OscType::Float(0.25),
            ]
        );

        let messages = command_to_messages(&Command::BufferWrite {
            buffer: BufNum(0),
            path: "out.aiff".into(),
            header_format: HeaderFormat::Aiff,
            sample_format: SampleFormat::Int24,
            frame_count: None,
            starting_frame: 0,
            leave_open: false,
        });
        assert_eq!(
            messages[0].args,
            vec![
                OscType::Int(0),
                OscType::String("out.aiff".to_string()),
                OscType::String("aiff".to_string()),
                OscType::String("int24".to_string()),
                OscType::Int(-1),
                OscType::Int(0),
                OscType::Int(0),
            ]
        );

        let messages = command_to_messages(&Command::BufferNormalize {
            buffer: BufNum(5),
            new_maximum: 0.5,
            as_wavetable: true,
        });
        assert_eq!(messages[0].args[1], OscType::String("wnormalize".to_string()));
    }

    #[test]
    fn test_write_length_prefixed() {
        let mut score = ScoreWriter::new();
        score.add_stream(&stream());
        assert_eq!(score.event_count(), 2);
        assert_eq!(score.duration(), 1.5);

        let mut bytes = Vec::new();
        score.write_to(&mut bytes).unwrap();

        let mut cursor = 0;
        let mut frames = 0;
        while cursor < bytes.len() {
            let len = i32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
            assert_eq!(&bytes[cursor + 4..cursor + 12], b"#bundle\0");
            cursor += 4 + len;
            frames += 1;
        }
        assert_eq!(cursor, bytes.len());
        assert_eq!(frames, 2);
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("score.osc");
        let mut score = ScoreWriter::new();
        score.add_stream(&stream());
        score.write_to_file(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_seconds_to_osc_time() {
        let time = seconds_to_osc_time(0.0);
        assert_eq!(time.seconds, 1);
        assert_eq!(time.fractional, 0);

        let time = seconds_to_osc_time(1.5);
        assert_eq!(time.seconds, 2);
        assert!(time.fractional > u32::MAX / 4);
        assert!(time.fractional < (u32::MAX / 4) * 3);
    }
}
