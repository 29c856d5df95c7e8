// Copyright 2024 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed message framing over a pair of byte streams.
//!
//! Messages travel as `<decimal-length>:<bytes>`. The usual setup pipes a
//! child process's stdin/stdout, but any reader/writer pair works. This is a
//! small interprocess helper on the side of the store, not part of it.

use std::io;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;

/// One endpoint of a framed pipe.
pub struct FramedPipe {
    child: Option<Child>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl FramedPipe {
    /// Spawns `argv` with piped stdin/stdout and frames messages over them.
    pub fn spawn(argv: &[&str]) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().expect("stdin was requested piped");
        let stdout = child.stdout.take().expect("stdout was requested piped");
        Ok(Self {
            child: Some(child),
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
        })
    }

    /// Wraps an existing stream pair, e.g. the ends inherited by a child.
    pub fn endpoint(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            child: None,
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(writer),
        }
    }

    /// Sends one framed message and flushes.
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        write!(self.writer, "{}:", data.len())?;
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    /// Receives one framed message.
    pub fn receive(&mut self) -> io::Result<Vec<u8>> {
        let mut frame_len: usize = 0;
        loop {
            let mut byte = [0u8];
            self.reader.read_exact(&mut byte).map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "could not read from peer")
                } else {
                    err
                }
            })?;
            match byte[0] {
                b':' => break,
                b'0'..=b'9' => {
                    frame_len = frame_len
                        .checked_mul(10)
                        .and_then(|len| len.checked_add(usize::from(byte[0] - b'0')))
                        .ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidData, "oversized frame header")
                        })?;
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "malformed frame header",
                    ));
                }
            }
        }
        let mut data = vec![0u8; frame_len];
        self.reader.read_exact(&mut data).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::UnexpectedEof, "premature EOF in read")
            } else {
                err
            }
        })?;
        Ok(data)
    }

    /// Closes both streams and reaps the child process, if any.
    pub fn close(mut self) -> io::Result<()> {
        drop(self.writer);
        drop(self.reader);
        if let Some(mut child) = self.child.take() {
            child.wait()?;
        }
        Ok(())
    }
}
