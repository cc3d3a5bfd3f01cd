//! Inbound line parsing and outbound line construction for the worker
//! control wire (spec §4.6, §6).

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::task::{Task, TaskId};
use crate::resource::ResourceBox;

/// Lines longer than this are rejected (spec §6, `LINE_MAX`).
pub const LINE_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQueryKind {
    Queue,
    Task,
    Worker,
    Resources,
    Wable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Dataswarm {
        protocol: u32,
        host: String,
        os: String,
        arch: String,
        version: String,
    },
    Info {
        field: String,
        value: String,
    },
    Resource {
        kind: String,
        total: u64,
        smallest: u64,
        largest: u64,
    },
    ResourceTag {
        value: String,
    },
    Feature {
        name: String,
    },
    CacheUpdate {
        name: String,
        size: u64,
        transfer_time_us: u64,
    },
    CacheInvalid {
        name: String,
        error_len: usize,
    },
    TransferAddress {
        addr: String,
        port: u16,
    },
    Result {
        status: String,
        exit_code: i32,
        out_len: usize,
        exec_us: u64,
        taskid: TaskId,
    },
    Update {
        taskid: TaskId,
        path: String,
        offset: u64,
        length: u64,
    },
    AvailableResults,
    StatusQuery(StatusQueryKind),
    HttpGet {
        path: String,
    },
    /// Unrecognized line, returned to the caller unprocessed (spec §4.6).
    Unrecognized(String),
}

/// Parses a single line (without its trailing `\n`). Lines over
/// `LINE_MAX` should be rejected by the reader before reaching here.
pub fn parse_line(line: &str) -> InboundMessage {
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match verb {
        "dataswarm" => {
            let mut f = rest.split(' ');
            let protocol = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let host = f.next().unwrap_or("unknown").to_string();
            let os = f.next().unwrap_or("").to_string();
            let arch = f.next().unwrap_or("").to_string();
            let version = f.next().unwrap_or("").to_string();
            InboundMessage::Dataswarm {
                protocol,
                host,
                os,
                arch,
                version,
            }
        }
        "info" => {
            let mut f = rest.splitn(2, ' ');
            let field = f.next().unwrap_or("").to_string();
            let value = f.next().unwrap_or("").to_string();
            InboundMessage::Info { field, value }
        }
        "resource" => {
            let mut f = rest.split(' ');
            let kind = f.next().unwrap_or("").to_string();
            if kind == "tag" {
                return InboundMessage::ResourceTag {
                    value: f.next().unwrap_or("").to_string(),
                };
            }
            let total = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let smallest = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let largest = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            InboundMessage::Resource {
                kind,
                total,
                smallest,
                largest,
            }
        }
        "feature" => {
            let decoded = percent_encoding::percent_decode_str(rest)
                .decode_utf8()
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| rest.to_string());
            InboundMessage::Feature { name: decoded }
        }
        "cache-update" => {
            let mut f = rest.split(' ');
            let name = f.next().unwrap_or("").to_string();
            let size = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let ttime = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            InboundMessage::CacheUpdate {
                name,
                size,
                transfer_time_us: ttime,
            }
        }
        "cache-invalid" => {
            let mut f = rest.split(' ');
            let name = f.next().unwrap_or("").to_string();
            let error_len = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            InboundMessage::CacheInvalid { name, error_len }
        }
        "transfer-address" => {
            let mut f = rest.split(' ');
            let addr = f.next().unwrap_or("").to_string();
            let port = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            InboundMessage::TransferAddress { addr, port }
        }
        "result" => {
            let mut f = rest.split(' ');
            let status = f.next().unwrap_or("").to_string();
            let exit_code = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let out_len = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let exec_us = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let taskid = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            InboundMessage::Result {
                status,
                exit_code,
                out_len,
                exec_us,
                taskid,
            }
        }
        "update" => {
            let mut f = rest.split(' ');
            let taskid = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let path = f.next().unwrap_or("").to_string();
            let offset = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let length = f.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            InboundMessage::Update {
                taskid,
                path,
                offset,
                length,
            }
        }
        "available_results" => InboundMessage::AvailableResults,
        "queue_status" => InboundMessage::StatusQuery(StatusQueryKind::Queue),
        "task_status" => InboundMessage::StatusQuery(StatusQueryKind::Task),
        "worker_status" => InboundMessage::StatusQuery(StatusQueryKind::Worker),
        "resources_status" => InboundMessage::StatusQuery(StatusQueryKind::Resources),
        "wable_status" => InboundMessage::StatusQuery(StatusQueryKind::Wable),
        "GET" => {
            let path = rest.split(' ').next().unwrap_or("/").to_string();
            InboundMessage::HttpGet { path }
        }
        _ => InboundMessage::Unrecognized(line.to_string()),
    }
}

/// Number of raw payload bytes following this control line on the wire
/// (spec §4.6): `result`'s stdout dump, `update`'s watched-file chunk,
/// `cache-invalid`'s error message. The reader calls this after parsing
/// a line to know how many extra bytes to splice off the socket before
/// resuming line reads.
pub fn trailing_payload_len(line: &str) -> usize {
    match parse_line(line) {
        InboundMessage::Result { out_len, .. } => out_len,
        InboundMessage::Update { length, .. } => length as usize,
        InboundMessage::CacheInvalid { error_len, .. } => error_len,
        _ => 0,
    }
}

/// Builds the `task <id> ... end\n` commit block (spec §4.7 commit,
/// §6 outbound verbs).
pub fn build_task_block(task: &Task, box_: &ResourceBox) -> String {
    let mut out = String::new();
    out.push_str(&format!("task {}\n", task.taskid));
    out.push_str(&format!("cmd {}\n{}\n", task.def.command_line.len(), task.def.command_line));
    if let Some(coprocess) = &task.def.coprocess_command {
        out.push_str(&format!("coprocess {}\n{}\n", coprocess.len(), coprocess));
    }
    out.push_str(&format!("category {}\n", task.def.category));
    out.push_str(&format!("cores {}\n", box_.cores));
    out.push_str(&format!("gpus {}\n", box_.gpus));
    out.push_str(&format!("memory {}\n", box_.memory));
    out.push_str(&format!("disk {}\n", box_.disk));
    if box_.end_time > 0 {
        out.push_str(&format!("end_time {}\n", box_.end_time));
    }
    if box_.wall_time > 0 {
        out.push_str(&format!("wall_time {}\n", box_.wall_time));
    }
    for (k, v) in &task.def.env {
        let line = format!("{k}={v}");
        out.push_str(&format!("env {}\n{}\n", line.len(), line));
    }
    for f in &task.def.input_files {
        let encoded = utf8_percent_encode(&f.remote_visible_name, NON_ALPHANUMERIC);
        out.push_str(&format!("infile {} {} {}\n", f.remote_cached_name, encoded, f.flags.0));
    }
    for f in &task.def.output_files {
        let encoded = utf8_percent_encode(&f.remote_visible_name, NON_ALPHANUMERIC);
        out.push_str(&format!("outfile {} {} {}\n", f.remote_cached_name, encoded, f.flags.0));
    }
    out.push_str("end\n");
    out
}

pub fn build_check() -> &'static str {
    "check\n"
}

pub fn build_kill(taskid: TaskId) -> String {
    format!("kill {taskid}\n")
}

pub fn build_kill_all() -> &'static str {
    "kill -1\n"
}

pub fn build_send_results() -> &'static str {
    "send_results -1\n"
}

pub fn build_unlink(cached_name: &str) -> String {
    format!("unlink {cached_name}\n")
}

pub fn build_release() -> &'static str {
    "release\n"
}

pub fn build_exit() -> &'static str {
    "exit\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dataswarm_handshake() {
        let msg = parse_line("dataswarm 10 host1 linux x86_64 7.7.7");
        assert_eq!(
            msg,
            InboundMessage::Dataswarm {
                protocol: 10,
                host: "host1".to_string(),
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
                version: "7.7.7".to_string(),
            }
        );
    }

    #[test]
    fn parses_resource_tag_specially() {
        let msg = parse_line("resource tag gpu-node");
        assert_eq!(
            msg,
            InboundMessage::ResourceTag {
                value: "gpu-node".to_string()
            }
        );
    }

    #[test]
    fn feature_name_is_percent_decoded() {
        let msg = parse_line("feature gpu%2Dv2");
        assert_eq!(
            msg,
            InboundMessage::Feature {
                name: "gpu-v2".to_string()
            }
        );
    }

    #[test]
    fn unrecognized_line_is_returned_unprocessed() {
        let msg = parse_line("frobnicate 1 2 3");
        assert_eq!(msg, InboundMessage::Unrecognized("frobnicate 1 2 3".to_string()));
    }

    #[test]
    fn http_get_extracts_path() {
        let msg = parse_line("GET /queue_status HTTP/1.0");
        assert_eq!(
            msg,
            InboundMessage::HttpGet {
                path: "/queue_status".to_string()
            }
        );
    }
}
