// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous communication between the update and build processes.
//!
//! Messages are (type, payload) records. On the wire each record is framed
//! with a little-endian u16 length; the record itself carries the message
//! type as a big-endian u32 followed by the UTF-8 payload. The framing is
//! self-synchronizing as long as both ends agree on the stream start.

pub mod pipe;

use std::collections::HashMap;
use std::io::{Read, Write};

use tracing::{debug, error, info, trace, warn};

use crate::error::{BuildError, Result};
use crate::module::Module;
use crate::phase::Phase;
use crate::state::PersistentState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MsgType {
    /// Used for a successful src checkout.
    ModuleSuccess = 1,
    /// Used for a failed src checkout.
    ModuleFailure = 2,
    /// Used for a skipped src checkout (i.e. build anyways).
    ModuleSkipped = 3,
    /// Used to skip building a module when it had no code updates.
    ModuleUptodate = 4,

    // One of these messages should be the first message placed on the queue.
    /// Used to indicate a skipped update process (i.e. build anyways).
    AllSkipped = 5,
    /// Used to indicate a major update failure (don't build).
    AllFailure = 6,
    /// Informational message, feel free to start the build.
    AllUpdating = 7,

    /// Used to indicate specifically that a source conflict has occurred.
    ModuleConflict = 8,
    /// Tagged message should be put to TTY for module.
    ModuleLogMsg = 9,
    /// Change to a persistent module option.
    ModulePersistOpt = 10,

    /// Affirmatively flags that all updates are done.
    AllDone = 11,

    /// A message to print after all work done.
    ModulePostBuildMsg = 12,
}

impl MsgType {
    pub fn from_u32(raw: u32) -> Option<MsgType> {
        use MsgType::*;
        Some(match raw {
            1 => ModuleSuccess,
            2 => ModuleFailure,
            3 => ModuleSkipped,
            4 => ModuleUptodate,
            5 => AllSkipped,
            6 => AllFailure,
            7 => AllUpdating,
            8 => ModuleConflict,
            9 => ModuleLogMsg,
            10 => ModulePersistOpt,
            11 => AllDone,
            12 => ModulePostBuildMsg,
            _ => return None,
        })
    }
}

/// Encodes a message record: big-endian type word followed by the payload.
pub fn encode_message(msg_type: MsgType, payload: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(msg_type as u32).to_be_bytes());
    buf.extend_from_slice(payload.as_bytes());
    buf
}

pub fn decode_message(record: &[u8]) -> Result<(MsgType, String)> {
    if record.len() < 4 {
        return Err(BuildError::internal("Truncated IPC record"));
    }
    let raw = u32::from_be_bytes(record[0..4].try_into().unwrap());
    let msg_type = MsgType::from_u32(raw)
        .ok_or_else(|| BuildError::internal(format!("Unhandled IPC type: {raw}")))?;
    let payload = String::from_utf8(record[4..].to_vec())
        .map_err(|_| BuildError::internal("Non-UTF-8 IPC payload"))?;
    Ok((msg_type, payload))
}

/// Writes a record with its u16 little-endian length prefix.
pub fn write_frame(writer: &mut impl Write, record: &[u8]) -> std::io::Result<()> {
    let len: u16 = record
        .len()
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "oversized IPC record"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(record)?;
    writer.flush()
}

/// Reads one length-prefixed record; `Ok(None)` means a clean EOF at a
/// frame boundary.
pub fn read_frame(reader: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u16::from_le_bytes(len_buf) as usize;
    let mut record = vec![0u8; len];
    reader.read_exact(&mut record)?;
    Ok(Some(record))
}

/// Transport used by an [`Ipc`] endpoint.
pub trait IpcChannel {
    fn send_record(&mut self, record: &[u8]) -> Result<()>;
    /// Returns `None` on end-of-stream.
    fn receive_record(&mut self) -> Result<Option<Vec<u8>>>;
    fn supports_concurrency(&self) -> bool {
        false
    }
    fn close(&mut self);
}

/// Fully synchronous channel used when update and build run in one process:
/// sends queue in memory, receives drain the queue.
#[derive(Default)]
pub struct NullChannel {
    queue: std::collections::VecDeque<Vec<u8>>,
}

impl IpcChannel for NullChannel {
    fn send_record(&mut self, record: &[u8]) -> Result<()> {
        self.queue.push_back(record.to_vec());
        Ok(())
    }

    fn receive_record(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.queue.pop_front())
    }

    fn close(&mut self) {}
}

/// Update status as tracked by the receiving (build) side.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateStatus {
    /// Build should proceed (covers successful updates, explicit skips, and
    /// forced refreshes).
    Success,
    /// Update failed or conflicted; build must be skipped.
    Failed,
    /// No changes to the source; build only if configured to.
    Skipped,
}

/// One endpoint of the update/build conversation, plus the receive-side
/// bookkeeping shared by both the builder and the end-of-run drain.
pub struct Ipc {
    channel: Box<dyn IpcChannel>,
    logged_module: String,
    waited_for_stream_start: bool,
    pub no_update: bool,
    updates_done: bool,
    updated: HashMap<String, UpdateStatus>,
    /// Holds log output from the update process, keyed by module.
    messages: HashMap<String, Vec<String>>,
    /// Like above but for post-build messages.
    postbuild: HashMap<String, Vec<String>>,
    /// If a module should build despite not being updated, why?
    why_refresh: HashMap<String, String>,
}

impl Ipc {
    pub fn new(channel: Box<dyn IpcChannel>) -> Self {
        Ipc {
            channel,
            logged_module: "global".to_string(),
            waited_for_stream_start: false,
            no_update: false,
            updates_done: false,
            updated: HashMap::new(),
            messages: HashMap::new(),
            postbuild: HashMap::new(),
            why_refresh: HashMap::new(),
        }
    }

    pub fn supports_concurrency(&self) -> bool {
        self.channel.supports_concurrency()
    }

    pub fn close(&mut self) {
        self.channel.close();
    }

    // Sender side.

    pub fn send(&mut self, msg_type: MsgType, payload: &str) -> Result<()> {
        let record = encode_message(msg_type, payload);
        self.channel.send_record(&record)
    }

    /// Sets which module messages sent by [`send_log_message`] are
    /// associated with.
    pub fn set_logged_module(&mut self, name: &str) {
        self.logged_module = name.to_string();
    }

    pub fn notify_update_success(&mut self, module: &str, msg: &str) -> Result<()> {
        self.send(MsgType::ModuleSuccess, &format!("{module},{msg}"))
    }

    /// Tells the main process that a persistent option for the given module
    /// must be changed; used by processes that do not own the persistent
    /// option store.
    pub fn notify_persistent_option_change(
        &mut self,
        module: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.send(MsgType::ModulePersistOpt, &format!("{module},{key},{value}"))
    }

    pub fn notify_post_build_message(&mut self, module: &str, msg: &str) -> Result<()> {
        self.send(MsgType::ModulePostBuildMsg, &format!("{module},{msg}"))
    }

    pub fn send_log_message(&mut self, logger: &str, level: &str, msg: &str) -> Result<()> {
        let module = self.logged_module.clone();
        self.send(MsgType::ModuleLogMsg, &format!("{module},{logger},{level},{msg}"))
    }

    // Receiver side.

    fn receive(&mut self) -> Result<Option<(MsgType, String)>> {
        if self.updates_done {
            return Err(BuildError::internal(
                "Trying to pull message from closed IPC channel!",
            ));
        }
        match self.channel.receive_record()? {
            Some(record) => decode_message(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Called any time we're waiting for an IPC message from a subprocess.
    /// There is no way to tell in advance which module we'll receive
    /// messages for.
    fn process_message(
        &mut self,
        msg_type: MsgType,
        payload: String,
        state: &mut PersistentState,
    ) -> Option<String> {
        match msg_type {
            MsgType::ModuleSuccess => {
                let (module, msg) = split2(&payload);
                self.updated.insert(module.to_string(), UpdateStatus::Success);
                Some(msg.to_string())
            }
            MsgType::ModuleSkipped => {
                // Success here means we should build even though we didn't
                // update; ModuleUptodate below means the *build* may be
                // skipped even though there was no failure.
                self.updated.insert(payload, UpdateStatus::Success);
                Some("skipped".to_string())
            }
            MsgType::ModuleConflict => {
                self.updated.insert(payload, UpdateStatus::Failed);
                Some("conflicts present".to_string())
            }
            MsgType::ModuleFailure => {
                self.updated.insert(payload, UpdateStatus::Failed);
                Some("update failed".to_string())
            }
            MsgType::ModuleUptodate => {
                let (module, refresh_reason) = split2(&payload);
                if refresh_reason.is_empty() {
                    self.updated.insert(module.to_string(), UpdateStatus::Skipped);
                } else {
                    self.updated.insert(module.to_string(), UpdateStatus::Success);
                    self.why_refresh
                        .insert(module.to_string(), refresh_reason.to_string());
                }
                Some("no files affected".to_string())
            }
            MsgType::ModulePersistOpt => {
                let mut parts = payload.splitn(3, ',');
                if let (Some(module), Some(key), Some(value)) =
                    (parts.next(), parts.next(), parts.next())
                {
                    state.set(module, key, value);
                }
                None
            }
            MsgType::ModuleLogMsg => {
                let (module, log_message) = split2(&payload);
                // Save it for later if we can't print it yet.
                self.messages
                    .entry(module.to_string())
                    .or_default()
                    .push(log_message.to_string());
                None
            }
            MsgType::AllDone => {
                self.updates_done = true;
                None
            }
            MsgType::ModulePostBuildMsg => {
                let (module, msg) = split2(&payload);
                self.postbuild
                    .entry(module.to_string())
                    .or_default()
                    .push(msg.to_string());
                None
            }
            MsgType::AllSkipped | MsgType::AllFailure | MsgType::AllUpdating => None,
        }
    }

    /// Waits on the IPC connection until one of the stream-start codes is
    /// returned. `AllSkipped` sets `no_update`; `AllFailure` is fatal. Only
    /// the first call waits.
    pub fn wait_for_stream_start(&mut self, state: &mut PersistentState) -> Result<()> {
        if self.waited_for_stream_start {
            return Ok(());
        }
        self.waited_for_stream_start = true;

        loop {
            let (msg_type, payload) = self.receive()?.ok_or_else(|| {
                BuildError::internal("IPC failure waiting for stream start")
            })?;
            match msg_type {
                MsgType::AllUpdating => return Ok(()),
                MsgType::AllSkipped => {
                    self.no_update = true;
                    self.updates_done = true;
                    return Ok(());
                }
                MsgType::AllFailure => {
                    return Err(BuildError::runtime(format!(
                        "Unable to perform source update for any module:\n\t{payload}"
                    )));
                }
                MsgType::ModuleLogMsg => {
                    let (module, log_message) = split2(&payload);
                    self.messages
                        .entry(module.to_string())
                        .or_default()
                        .push(log_message.to_string());
                }
                other => {
                    return Err(BuildError::runtime(format!(
                        "IPC failure while expecting an update status: incorrect type: {other:?}"
                    )));
                }
            }
        }
    }

    /// Waits for the update status of the given module, printing buffered
    /// log messages (global first) as they become available. Post-build
    /// messages received along the way are attached to the module.
    pub fn wait_for_module(
        &mut self,
        module: &mut Module,
        state: &mut PersistentState,
    ) -> Result<(UpdateStatus, String)> {
        let name = module.name().to_string();

        self.wait_for_stream_start(state)?;

        // No update phase? Just mark as successful.
        if self.no_update || !module.phases().has(Phase::Update) {
            self.updated.insert(name.clone(), UpdateStatus::Success);
            return Ok((UpdateStatus::Success, "Skipped".to_string()));
        }

        let mut message = String::new();
        while !self.updated.contains_key(&name) && !self.updates_done {
            let Some((msg_type, payload)) = self.receive()? else {
                break;
            };
            if let Some(msg) = self.process_message(msg_type, payload, state) {
                message = msg;
            }

            // Any 'global' messages are probably for the first module and
            // include standard setup messages; print those first.
            for key in ["global", name.as_str()] {
                if let Some(pending) = self.messages.remove(key) {
                    for line in pending {
                        print_logged_message(&line);
                    }
                }
            }
        }

        if let Some(pending) = self.postbuild.remove(&name) {
            for msg in pending {
                module.add_post_build_message(msg);
            }
        }

        let status = self
            .updated
            .get(&name)
            .copied()
            .ok_or_else(|| BuildError::internal(format!("No update status for {name}")))?;
        Ok((status, message))
    }

    /// Drains the stream to completion so late messages (persistent options
    /// in particular) are not lost when the build loop ends early.
    pub fn wait_for_end(&mut self, state: &mut PersistentState) -> Result<()> {
        self.wait_for_stream_start(state)?;
        while !self.no_update && !self.updates_done {
            match self.receive()? {
                Some((msg_type, payload)) => {
                    self.process_message(msg_type, payload, state);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Returns the reason to rebuild a non-updated module, if any.
    pub fn refresh_reason_for(&self, module: &str) -> String {
        self.why_refresh.get(module).cloned().unwrap_or_default()
    }

    /// Flags the given module as ignorable from now on, for use after the
    /// module has been waited on.
    pub fn forget_module(&mut self, module: &str) {
        self.updated.remove(module);
    }

    /// Module names with update statuses not yet acknowledged with
    /// [`forget_module`]. Non-empty when the build loop ended earlier than
    /// the update stream.
    pub fn unacknowledged_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.updated.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shows any messages still queued near the end of the run.
    pub fn output_pending_logged_messages(&mut self) {
        for (module, lines) in std::mem::take(&mut self.messages) {
            let non_empty: Vec<&String> = lines
                .iter()
                .filter(|line| !line.splitn(3, ',').nth(2).unwrap_or("").is_empty())
                .collect();
            if non_empty.is_empty() {
                continue;
            }
            debug!("Unhandled messages for module {module}:");
            for line in non_empty {
                print_logged_message(line);
            }
        }
    }
}

fn split2(payload: &str) -> (&str, &str) {
    payload.split_once(',').unwrap_or((payload, ""))
}

/// Prints a forwarded `logger,level,msg` log line on the TTY-owning side.
fn print_logged_message(combined: &str) {
    let mut parts = combined.splitn(3, ',');
    let logger = parts.next().unwrap_or("");
    let level = parts.next().unwrap_or("");
    let msg = parts.next().unwrap_or("");
    let msg = if msg.starts_with(char::is_whitespace) {
        msg.to_string()
    } else {
        format!("\t{msg}")
    };
    match level {
        "ERROR" => error!(target: "forwarded", "[{logger}]{msg}"),
        "WARNING" => warn!(target: "forwarded", "[{logger}]{msg}"),
        "DEBUG" => debug!(target: "forwarded", "[{logger}]{msg}"),
        "TRACE" => trace!(target: "forwarded", "[{logger}]{msg}"),
        _ => info!(target: "forwarded", "[{logger}]{msg}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn null_ipc() -> Ipc {
        Ipc::new(Box::<NullChannel>::default())
    }

    #[test]
    fn stream_start_buffers_early_log_messages() {
        let mut state = PersistentState::default();
        let mut ipc = null_ipc();
        ipc.send(MsgType::ModuleLogMsg, "global,logger,INFO,starting")
            .unwrap();
        ipc.send(MsgType::AllUpdating, "").unwrap();

        ipc.wait_for_stream_start(&mut state).unwrap();
        assert!(!ipc.no_update);
        assert_eq!(
            ipc.messages.get("global").unwrap(),
            &vec!["logger,INFO,starting".to_string()]
        );
    }

    #[test]
    fn all_skipped_sets_no_update() {
        let mut state = PersistentState::default();
        let mut ipc = null_ipc();
        ipc.send(MsgType::AllSkipped, "no-update requested").unwrap();
        ipc.wait_for_stream_start(&mut state).unwrap();
        assert!(ipc.no_update);
    }

    #[test]
    fn all_failure_is_fatal() {
        let mut state = PersistentState::default();
        let mut ipc = null_ipc();
        ipc.send(MsgType::AllFailure, "ssh-failure").unwrap();
        assert!(ipc.wait_for_stream_start(&mut state).is_err());
    }

    #[test]
    fn uptodate_with_reason_is_success() {
        let mut state = PersistentState::default();
        let mut ipc = null_ipc();
        ipc.process_message(
            MsgType::ModuleUptodate,
            "juk,the option refresh-build was set".to_string(),
            &mut state,
        );
        assert_eq!(ipc.updated.get("juk"), Some(&UpdateStatus::Success));
        assert_eq!(ipc.refresh_reason_for("juk"), "the option refresh-build was set");

        ipc.process_message(MsgType::ModuleUptodate, "ark,".to_string(), &mut state);
        assert_eq!(ipc.updated.get("ark"), Some(&UpdateStatus::Skipped));
    }

    #[test]
    fn persist_opt_applies_to_state() {
        let mut state = PersistentState::default();
        let mut ipc = null_ipc();
        ipc.process_message(
            MsgType::ModulePersistOpt,
            "juk,git-cloned-repository,kde:juk.git".to_string(),
            &mut state,
        );
        assert_eq!(
            state.get_str("juk", "git-cloned-repository").unwrap(),
            "kde:juk.git"
        );
    }

    #[test]
    fn frame_roundtrip_simple() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &encode_message(MsgType::ModuleSuccess, "juk,1 file affected.")).unwrap();
        write_frame(&mut buf, &encode_message(MsgType::AllDone, "had_errors: 0")).unwrap();

        let mut cursor = Cursor::new(buf);
        let first = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(
            decode_message(&first).unwrap(),
            (MsgType::ModuleSuccess, "juk,1 file affected.".to_string())
        );
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(
            decode_message(&second).unwrap(),
            (MsgType::AllDone, "had_errors: 0".to_string())
        );
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    proptest! {
        // The framing is injective and self-synchronizing: encoding any
        // sequence of (type, payload) pairs then decoding yields the
        // original sequence.
        #[test]
        fn frame_roundtrip(messages in proptest::collection::vec(
            (1u32..=12, "[^,]{0,200}"), 0..20)
        ) {
            let mut buf = Vec::new();
            for (raw, payload) in &messages {
                let msg_type = MsgType::from_u32(*raw).unwrap();
                write_frame(&mut buf, &encode_message(msg_type, payload)).unwrap();
            }

            let mut cursor = Cursor::new(buf);
            let mut decoded = Vec::new();
            while let Some(record) = read_frame(&mut cursor).unwrap() {
                let (msg_type, payload) = decode_message(&record).unwrap();
                decoded.push((msg_type as u32, payload));
            }
            prop_assert_eq!(decoded, messages);
        }
    }
}
