/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt::Write;

/// Progress of the request towards the ICAP server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum WritingState {
    Init,
    Connecting,
    Headers,
    Preview,
    /// Preview written, waiting for the server to decide.
    Paused,
    Prime,
    /// The last write is still pending.
    AlmostDone,
    ReallyDone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ParsingState {
    IcapHeader,
    HttpHeader,
    Body,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SendingState {
    Undecided,
    /// Echoing the virgin body.
    Virgin,
    Adapted,
    Done,
}

pub(super) struct ModXactState {
    pub(super) writing: WritingState,
    pub(super) parsing: ParsingState,
    pub(super) sending: SendingState,
    pub(super) service_waiting: bool,
    pub(super) waited_for_service: bool,
    pub(super) allowed_postview_204: bool,
    pub(super) allowed_206: bool,
    /// A 206 answer may end with the tail of the virgin body.
    pub(super) partial_content: bool,
}

impl Default for ModXactState {
    fn default() -> Self {
        ModXactState {
            writing: WritingState::Init,
            parsing: ParsingState::IcapHeader,
            sending: SendingState::Undecided,
            service_waiting: false,
            waited_for_service: false,
            allowed_postview_204: false,
            allowed_206: false,
            partial_content: false,
        }
    }
}

impl ModXactState {
    #[inline]
    pub(super) fn parsing_headers(&self) -> bool {
        matches!(
            self.parsing,
            ParsingState::IcapHeader | ParsingState::HttpHeader
        )
    }

    #[inline]
    pub(super) fn done_parsing(&self) -> bool {
        self.parsing == ParsingState::Done
    }

    #[inline]
    pub(super) fn done_writing(&self) -> bool {
        self.writing == WritingState::ReallyDone
    }

    #[inline]
    pub(super) fn done_sending(&self) -> bool {
        self.sending == SendingState::Done
    }

    /// Neither writing nor sending needs virgin body bytes any more.
    pub(super) fn done_consuming_virgin(&self) -> bool {
        self.writing >= WritingState::AlmostDone
            && match self.sending {
                SendingState::Adapted => !self.partial_content,
                SendingState::Done => true,
                SendingState::Undecided | SendingState::Virgin => false,
            }
    }

    pub(super) fn status_into(&self, s: &mut String) {
        let w = match self.writing {
            WritingState::Init => "",
            WritingState::Connecting => "w(Connecting)",
            WritingState::Headers => "w(Headers)",
            WritingState::Preview => "w(Preview)",
            WritingState::Paused => "w(Paused)",
            WritingState::Prime => "w(Prime)",
            WritingState::AlmostDone => "w(AlmostDone)",
            WritingState::ReallyDone => "W",
        };
        s.push_str(w);
        let p = match self.parsing {
            ParsingState::IcapHeader => "",
            ParsingState::HttpHeader => " p(HttpHeader)",
            ParsingState::Body => " p(Body)",
            ParsingState::Done => " P",
        };
        s.push_str(p);
        let _ = match self.sending {
            SendingState::Undecided => Ok(()),
            SendingState::Virgin => write!(s, " s(Virgin)"),
            SendingState::Adapted => write!(s, " s(Adapted)"),
            SendingState::Done => write!(s, " S"),
        };
        if self.service_waiting {
            s.push_str(" waiting");
        }
    }
}

/// What is known about the size of the virgin body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SizedEstimate {
    NoBody,
    Unknown,
    Known(u64),
}

impl SizedEstimate {
    #[inline]
    pub(super) fn expected(&self) -> bool {
        !matches!(self, SizedEstimate::NoBody)
    }

    pub(super) fn known_size(&self) -> Option<u64> {
        match self {
            SizedEstimate::NoBody => Some(0),
            SizedEstimate::Unknown => None,
            SizedEstimate::Known(n) => Some(*n),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ActState {
    #[default]
    Undecided,
    Active,
    Disabled,
}

/// A claim on the virgin body: bytes from `offset` on are still needed.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct VirginBodyAct {
    state: ActState,
    start: u64,
}

impl VirginBodyAct {
    /// Activate the claim from the body start. Fails once disabled.
    pub(super) fn plan(&mut self) -> bool {
        if self.state == ActState::Disabled {
            return false;
        }
        self.state = ActState::Active;
        true
    }

    pub(super) fn disable(&mut self) {
        self.state = ActState::Disabled;
    }

    pub(super) fn progress(&mut self, size: usize) {
        debug_assert!(self.active());
        self.start += size as u64;
    }

    #[inline]
    pub(super) fn offset(&self) -> u64 {
        self.start
    }

    #[inline]
    pub(super) fn active(&self) -> bool {
        self.state == ActState::Active
    }

    #[inline]
    pub(super) fn disabled(&self) -> bool {
        self.state == ActState::Disabled
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PreviewState {
    Disabled,
    Writing,
    /// The whole body fit in the preview.
    Ieof,
    Done,
}

/// The preview offered to the server.
#[derive(Clone, Copy, Debug)]
pub(super) struct Preview {
    state: PreviewState,
    advertised: usize,
    written: usize,
}

impl Default for Preview {
    fn default() -> Self {
        Preview {
            state: PreviewState::Disabled,
            advertised: 0,
            written: 0,
        }
    }
}

impl Preview {
    pub(super) fn enable(&mut self, size: usize) {
        self.state = PreviewState::Writing;
        self.advertised = size;
    }

    #[inline]
    pub(super) fn enabled(&self) -> bool {
        self.state != PreviewState::Disabled
    }

    #[inline]
    pub(super) fn advertised(&self) -> usize {
        self.advertised
    }

    #[inline]
    pub(super) fn done(&self) -> bool {
        matches!(self.state, PreviewState::Ieof | PreviewState::Done)
    }

    #[inline]
    pub(super) fn ieof(&self) -> bool {
        self.state == PreviewState::Ieof
    }

    /// Bytes still to be written to complete the preview.
    pub(super) fn debt(&self) -> usize {
        if self.done() {
            0
        } else {
            self.advertised - self.written
        }
    }

    pub(super) fn wrote(&mut self, size: usize, wrote_eof: bool) {
        debug_assert_eq!(self.state, PreviewState::Writing);
        self.written += size;
        debug_assert!(self.written <= self.advertised);
        if wrote_eof {
            self.state = PreviewState::Ieof;
        } else if self.written >= self.advertised {
            self.state = PreviewState::Done;
        }
    }
}
