// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pipe-backed IPC transport, used together with fork(2) to connect the
//! updater, monitor and build processes.

use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};

use nix::unistd;

use crate::error::{BuildError, Result};
use crate::ipc::{read_frame, write_frame, IpcChannel};

/// A one-directional framed channel over an anonymous pipe. Created before
/// forking; afterwards each side claims its end with [`set_sender`] or
/// [`set_receiver`], which closes the opposite end in that process.
pub struct PipeChannel {
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
    reader: Option<File>,
    writer: Option<File>,
}

impl PipeChannel {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) =
            unistd::pipe().map_err(|err| BuildError::runtime(format!("pipe: {err}")))?;
        Ok(PipeChannel {
            read_fd: Some(read_fd),
            write_fd: Some(write_fd),
            reader: None,
            writer: None,
        })
    }

    /// Call this to let the channel know it lives in the sending process.
    pub fn set_sender(&mut self) {
        if let Some(fd) = self.read_fd.take() {
            let _ = unistd::close(fd);
        }
        if let Some(fd) = self.write_fd.take() {
            // Safety: we own the fd and hand it to File exactly once.
            self.writer = Some(unsafe { File::from_raw_fd(fd) });
        }
    }

    pub fn set_receiver(&mut self) {
        if let Some(fd) = self.write_fd.take() {
            let _ = unistd::close(fd);
        }
        if let Some(fd) = self.read_fd.take() {
            self.reader = Some(unsafe { File::from_raw_fd(fd) });
        }
    }

    /// Raw fd of the claimed read end, for poll(2) registration.
    pub fn reader_fd(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        self.reader.as_ref().map(|f| f.as_raw_fd())
    }

    /// Raw fd of the claimed write end, for poll(2) registration.
    pub fn writer_fd(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        self.writer.as_ref().map(|f| f.as_raw_fd())
    }
}

impl IpcChannel for PipeChannel {
    fn send_record(&mut self, record: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BuildError::internal("PipeChannel used before set_sender"))?;
        write_frame(writer, record)
            .map_err(|err| BuildError::runtime(format!("Unable to write full msg to pipe: {err}")))
    }

    fn receive_record(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| BuildError::internal("PipeChannel used before set_receiver"))?;
        read_frame(reader)
            .map_err(|err| BuildError::runtime(format!("Unable to read msg from pipe: {err}")))
    }

    fn supports_concurrency(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.reader = None;
        self.writer = None;
        if let Some(fd) = self.read_fd.take() {
            let _ = unistd::close(fd);
        }
        if let Some(fd) = self.write_fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        if let Some(fd) = self.read_fd.take() {
            let _ = unistd::close(fd);
        }
        if let Some(fd) = self.write_fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{decode_message, encode_message, MsgType};

    // Both ends claimed in one process; small messages fit in the pipe
    // buffer so this does not deadlock.
    #[test]
    fn sends_and_receives_within_one_process() {
        let mut sender = PipeChannel::new().unwrap();
        let mut receiver = PipeChannel::new().unwrap();

        // Wire sender's write end to receiver's read end by swapping fds.
        std::mem::swap(&mut sender.read_fd, &mut receiver.read_fd);
        sender.set_sender();
        receiver.set_receiver();

        sender
            .send_record(&encode_message(MsgType::ModuleSkipped, "dolphin"))
            .unwrap();
        sender.close();

        let record = receiver.receive_record().unwrap().unwrap();
        assert_eq!(
            decode_message(&record).unwrap(),
            (MsgType::ModuleSkipped, "dolphin".to_string())
        );
        assert!(receiver.receive_record().unwrap().is_none());
    }
}
