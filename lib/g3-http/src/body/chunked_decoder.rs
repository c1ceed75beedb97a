/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use atoi::FromRadix10Checked;
use bytes::{Buf, BytesMut};
use log::trace;
use thiserror::Error;

use crate::parse::{HttpChunkedLine, HttpLineParseError};

#[derive(Debug, Error)]
pub enum ChunkedDecodeError {
    #[error("corrupted chunk size: {0}")]
    InvalidChunkSize(HttpLineParseError),
    #[error("found data between chunk end and CRLF")]
    DataBeforeChunkEnd,
    #[error("too long chunk line (> {0})")]
    LineTooLong(usize),
    #[error("invalid use-original-body value")]
    InvalidUseOriginalBody,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkedDecodeStatus {
    ParsedAll,
    NeedMoreData,
    NeedMoreSpace,
}

/// Where decoded body bytes go.
pub trait ChunkedSink {
    fn space_size(&self) -> usize;

    /// Append as much as fits, returning the appended size.
    fn append(&mut self, data: &[u8]) -> usize;
}

impl ChunkedSink for Vec<u8> {
    fn space_size(&self) -> usize {
        usize::MAX - self.len()
    }

    fn append(&mut self, data: &[u8]) -> usize {
        self.extend_from_slice(data);
        data.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailer,
    Done,
}

/// Restartable decoder of chunked transfer coding.
///
/// Unparsed input is left in the caller's buffer, so the caller appends new
/// data and calls [`ChunkedDecoder::parse`] again.
pub struct ChunkedDecoder {
    line_max_size: usize,
    state: DecodeState,
    decoded: u64,
    ieof: bool,
    use_original_body: Option<u64>,
}

impl ChunkedDecoder {
    pub fn new(line_max_size: usize) -> Self {
        ChunkedDecoder {
            line_max_size,
            state: DecodeState::ChunkSize,
            decoded: 0,
            ieof: false,
            use_original_body: None,
        }
    }

    pub fn decoded_size(&self) -> u64 {
        self.decoded
    }

    /// The last chunk carried the `ieof` extension.
    pub fn ieof(&self) -> bool {
        self.ieof
    }

    /// Offset given by the `use-original-body` extension of the last chunk.
    pub fn use_original_body(&self) -> Option<u64> {
        self.use_original_body
    }

    pub fn finished(&self) -> bool {
        self.state == DecodeState::Done
    }

    fn next_line<'a>(&self, input: &'a [u8]) -> Result<Option<&'a [u8]>, ChunkedDecodeError> {
        match memchr::memchr(b'\n', input) {
            Some(p) => {
                if p > self.line_max_size {
                    return Err(ChunkedDecodeError::LineTooLong(self.line_max_size));
                }
                Ok(Some(&input[..=p]))
            }
            None => {
                if input.len() > self.line_max_size {
                    Err(ChunkedDecodeError::LineTooLong(self.line_max_size))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn parse_last_chunk_extension(&mut self, chunk: &HttpChunkedLine) -> Result<(), ChunkedDecodeError> {
        for (name, value) in chunk.extension_pairs() {
            if name.eq_ignore_ascii_case("ieof") {
                self.ieof = true;
            } else if name.eq_ignore_ascii_case("use-original-body") {
                let value = value.unwrap_or_default().as_bytes();
                let (offset, len) = u64::from_radix_10_checked(value);
                match offset {
                    Some(offset) if len == value.len() && len > 0 => {
                        self.use_original_body = Some(offset)
                    }
                    _ => return Err(ChunkedDecodeError::InvalidUseOriginalBody),
                }
            }
        }
        Ok(())
    }

    pub fn parse(
        &mut self,
        input: &mut BytesMut,
        sink: &mut dyn ChunkedSink,
    ) -> Result<ChunkedDecodeStatus, ChunkedDecodeError> {
        loop {
            match self.state {
                DecodeState::ChunkSize => {
                    let Some(line) = self.next_line(input)? else {
                        return Ok(ChunkedDecodeStatus::NeedMoreData);
                    };
                    let line_len = line.len();
                    let chunk =
                        HttpChunkedLine::parse(line).map_err(ChunkedDecodeError::InvalidChunkSize)?;
                    trace!("found chunk: {}", chunk.chunk_size);
                    if chunk.chunk_size == 0 {
                        self.parse_last_chunk_extension(&chunk)?;
                        self.state = DecodeState::Trailer;
                    } else {
                        self.state = DecodeState::ChunkData(chunk.chunk_size);
                    }
                    input.advance(line_len);
                }
                DecodeState::ChunkData(left) => {
                    if input.is_empty() {
                        return Ok(ChunkedDecodeStatus::NeedMoreData);
                    }
                    if sink.space_size() == 0 {
                        return Ok(ChunkedDecodeStatus::NeedMoreSpace);
                    }
                    let avail = usize::try_from(left)
                        .unwrap_or(usize::MAX)
                        .min(input.len());
                    let n = sink.append(&input[..avail]);
                    input.advance(n);
                    self.decoded += n as u64;
                    let left = left - n as u64;
                    self.state = if left == 0 {
                        DecodeState::ChunkEnd
                    } else {
                        DecodeState::ChunkData(left)
                    };
                }
                DecodeState::ChunkEnd => {
                    let Some(line) = self.next_line(input)? else {
                        if input.iter().any(|b| *b != b'\r') {
                            return Err(ChunkedDecodeError::DataBeforeChunkEnd);
                        }
                        return Ok(ChunkedDecodeStatus::NeedMoreData);
                    };
                    if line[..line.len() - 1].iter().any(|b| *b != b'\r') {
                        return Err(ChunkedDecodeError::DataBeforeChunkEnd);
                    }
                    let line_len = line.len();
                    input.advance(line_len);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailer => {
                    let Some(line) = self.next_line(input)? else {
                        return Ok(ChunkedDecodeStatus::NeedMoreData);
                    };
                    let empty = line == b"\r\n" || line == b"\n";
                    let line_len = line.len();
                    input.advance(line_len);
                    if empty {
                        self.state = DecodeState::Done;
                    }
                }
                DecodeState::Done => return Ok(ChunkedDecodeStatus::ParsedAll),
            }
        }
    }
}
