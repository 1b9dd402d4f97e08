//! Chrome DevTools `.cpuprofile` export
//!
//! The document lists the top-down tree in pre-order, one node per tree node
//! with its stable id, followed by the sample sequence as node ids and the
//! time between consecutive samples in microseconds.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::codemap::{CodeFlavor, CodeId};
use crate::error::{Error, Result};
use crate::profile::{parse_name_location, Profile};

/// A DevTools CPU profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfile {
    pub nodes: Vec<CpuProfileNode>,
    /// Microseconds
    pub start_time: u64,
    /// Microseconds
    pub end_time: u64,
    /// Node id sampled at each tick
    pub samples: Vec<u32>,
    /// Microseconds since the previous sample; the first is measured from
    /// `start_time`
    pub time_deltas: Vec<i64>,
}

/// One node of a [`CpuProfile`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfileNode {
    pub id: u32,
    pub call_frame: CallFrame,
    pub hit_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deopt_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub position_ticks: Vec<PositionTick>,
}

/// Function and location of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub function_name: String,
    pub script_id: String,
    pub url: String,
    /// 0-based, -1 when unknown
    pub line_number: i64,
    /// 0-based, -1 when unknown
    pub column_number: i64,
}

/// Samples that hit one source line of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionTick {
    /// 1-based
    pub line: u32,
    pub ticks: u64,
}

impl CpuProfile {
    /// Export a finalized profile
    pub fn from_profile(profile: &Profile) -> Result<Self> {
        if !profile.is_finalized() {
            return Err(Error::IllegalState(
                "a profile must be finalized before it is exported".to_string(),
            ));
        }
        let tree = profile.tree();
        let mut nodes = Vec::with_capacity(tree.len());
        tree.traverse_in_depth(
            |_, node| {
                nodes.push(CpuProfileNode {
                    id: node.id,
                    call_frame: call_frame(profile, &node.label, node.entry),
                    hit_count: node.self_weight,
                    children: node.children().iter().map(|c| tree.node(*c).id).collect(),
                    deopt_reason: node
                        .entry
                        .and_then(|id| profile.entry(id).deopt_reasons.last().cloned()),
                    position_ticks: node
                        .line_ticks
                        .iter()
                        .map(|(line, ticks)| PositionTick {
                            line: *line,
                            ticks: *ticks,
                        })
                        .collect(),
                });
            },
            |_, _| {},
        );

        let start_time = profile.start_time().unwrap_or(0);
        let mut previous = start_time;
        let mut samples = Vec::with_capacity(profile.samples().len());
        let mut time_deltas = Vec::with_capacity(profile.samples().len());
        for sample in profile.samples() {
            samples.push(tree.node(sample.node).id);
            time_deltas.push(sample.timestamp as i64 - previous as i64);
            previous = sample.timestamp;
        }

        Ok(Self {
            nodes,
            start_time,
            end_time: profile.end_time().unwrap_or(start_time),
            samples,
            time_deltas,
        })
    }

    /// Serialize as JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Write JSON to `writer`
    pub fn write_to(&self, writer: impl Write) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Write a `.cpuprofile` file
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn call_frame(profile: &Profile, label: &str, entry: Option<CodeId>) -> CallFrame {
    let unknown = CallFrame {
        function_name: label.to_string(),
        script_id: "0".to_string(),
        url: String::new(),
        line_number: -1,
        column_number: -1,
    };
    let Some(id) = entry else {
        return unknown;
    };
    let code = profile.entry(id);
    let function = match code.flavor {
        CodeFlavor::DynamicFunc { func, .. } => profile.entry(func),
        CodeFlavor::SharedFunction => code,
        _ => return unknown,
    };

    let bare = function.bare_function_name();
    let function_name = if bare.is_empty() {
        "(anonymous)".to_string()
    } else {
        bare.to_string()
    };
    let script_id = code
        .source
        .as_ref()
        .map_or_else(|| "0".to_string(), |s| s.script_id.to_string());
    match parse_name_location(&function.name) {
        Some((url, line, column)) => CallFrame {
            function_name,
            script_id,
            url: profile.script_url(id).unwrap_or_else(|| url.to_string()),
            line_number: i64::from(line) - 1,
            column_number: i64::from(column) - 1,
        },
        None => CallFrame {
            function_name,
            script_id,
            url: profile.script_url(id).unwrap_or_default(),
            ..unknown
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;
    use crate::profile::TickSample;
    use crate::versions::{FunctionState, VmState};

    fn tick(pc: u64, timestamp: u64) -> TickSample {
        TickSample {
            pc,
            timestamp,
            is_external_callback: false,
            tos_or_external_callback: 0,
            vm_state: VmState::Js,
            stack: Vec::new(),
        }
    }

    fn finalized() -> Profile {
        let mut profile = Profile::new(&ProfileConfig::default()).unwrap();
        profile
            .add_func_code("JS", "foo file:///a.js:3:10", 1, 0x1000, 0x40, 0x9000, FunctionState::Turbofan, None)
            .unwrap();
        profile
            .add_func_code("JS", " file:///a.js:9:1", 1, 0x2000, 0x40, 0x9100, FunctionState::Interpreted, None)
            .unwrap();
        profile.add_deopt_reason(0x1004, "wrong map").unwrap();
        profile.record_tick(&tick(0x1004, 100)).unwrap();
        profile.record_tick(&tick(0x2004, 150)).unwrap();
        profile.record_tick(&tick(0xdead, 175)).unwrap();
        profile.finalize();
        profile
    }

    #[test]
    fn test_export_shape() {
        let profile = finalized();
        let cpu = profile.cpu_profile().unwrap();
        assert_eq!(cpu.start_time, 100);
        assert_eq!(cpu.end_time, 175);
        assert_eq!(cpu.time_deltas, vec![0, 50, 25]);
        assert_eq!(cpu.nodes[0].call_frame.function_name, "(root)");
        assert_eq!(cpu.nodes[0].children.len(), 3);

        let foo = cpu.nodes.iter().find(|n| n.call_frame.function_name == "foo").unwrap();
        assert_eq!(foo.call_frame.url, "file:///a.js");
        assert_eq!(foo.call_frame.line_number, 2);
        assert_eq!(foo.call_frame.column_number, 9);
        assert_eq!(foo.deopt_reason.as_deref(), Some("wrong map"));
        assert!(cpu.nodes.iter().any(|n| n.call_frame.function_name == "(anonymous)"));
        assert!(cpu.nodes.iter().any(|n| n.call_frame.function_name == "(program)"));

        let hits: u64 = cpu.nodes.iter().map(|n| n.hit_count).sum();
        assert_eq!(hits as usize, cpu.samples.len());
    }

    #[test]
    fn test_json_uses_devtools_names() {
        let json = finalized().cpu_profile().unwrap().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["timeDeltas"].is_array());
        assert!(value["nodes"][0]["callFrame"]["scriptId"].is_string());
        assert!(value["nodes"][0]["hitCount"].is_number());
        let back: CpuProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.samples.len(), 3);
    }

    #[test]
    fn test_requires_finalized_profile() {
        let profile = Profile::new(&ProfileConfig::default()).unwrap();
        assert!(matches!(profile.cpu_profile(), Err(Error::IllegalState(_))));
    }
}
