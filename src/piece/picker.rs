//! Piece selection: rarest-first, sequential (with fallback), streaming,
//! and the endgame request duplication, implemented over the state owned by
//! [`PieceManager`].

use super::{PieceManager, PieceState, RequestPlan, SELECT_FAN_OUT};
use crate::{conf::PieceSelection, BlockInfo, PeerKey, PieceIndex};

impl PieceManager {
    /// One idempotent selection tick: picks up to a small fan-out of missing
    /// pieces under the configured strategy and plans block requests towards
    /// peers that have them and may be asked.
    ///
    /// The returned plan never violates the per-peer invariants: every
    /// planned request targets a peer that advertises the piece, is not
    /// choking us, and has pipeline capacity left.
    pub fn select_pieces(&mut self) -> RequestPlan {
        let mut plan = RequestPlan::default();
        if self.pieces.is_empty() {
            return plan;
        }

        let missing = self.missing_pieces();
        let candidates = match self.strategy.piece_selection {
            PieceSelection::RarestFirst => self.select_rarest_first(&missing),
            PieceSelection::Sequential => self.select_sequential(&missing),
            PieceSelection::Streaming => self.select_streaming(&missing),
        };

        for index in candidates {
            self.plan_piece(index, &mut plan);
        }

        // re-issue requests for blocks that lost their only in-flight
        // request (choke, departure) while their piece was underway
        let stalled: Vec<PieceIndex> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, piece)| {
                matches!(
                    piece.state,
                    PieceState::Requested | PieceState::Downloading
                ) && piece
                    .blocks
                    .iter()
                    .any(|b| !b.received && b.requested_from.is_empty())
            })
            .map(|(index, _)| index)
            .collect();
        for index in stalled {
            self.plan_piece(index, &mut plan);
        }

        self.update_endgame();
        plan
    }

    /// Rarest-first: `score = (1000 - frequency) + priority`, highest score
    /// first, ties broken by insertion (index) order. Pieces no connected
    /// peer advertises are skipped.
    fn select_rarest_first(&self, missing: &[PieceIndex]) -> Vec<PieceIndex> {
        let mut scored: Vec<(i64, PieceIndex)> = missing
            .iter()
            .filter(|index| self.frequency(**index) > 0)
            .map(|index| {
                let score = (1000 - self.frequency(*index) as i64)
                    + self.pieces[*index].priority;
                (score, *index)
            })
            .collect();
        // a stable sort keeps equal scores in index order
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(SELECT_FAN_OUT)
            .map(|(_, index)| index)
            .collect()
    }

    /// Sequential: pieces in `[cursor, cursor + window)`, falling back to
    /// rarest-first for this tick when the window's average availability is
    /// below the configured fraction of the connected peer count.
    fn select_sequential(&mut self, missing: &[PieceIndex]) -> Vec<PieceIndex> {
        if missing.is_empty() {
            return Vec::new();
        }

        let cursor = self.sequential_position(missing);
        let window_end = (cursor + self.strategy.sequential_window)
            .min(self.pieces.len());
        let window: Vec<PieceIndex> = missing
            .iter()
            .copied()
            .filter(|index| (cursor..window_end).contains(index))
            .collect();

        if window.is_empty() {
            // the window is fully downloaded; move the cursor forward
            self.sequential_cursor = missing[0];
            return self.select_rarest_first(missing);
        }

        let active_peers = self.availability_len();
        if active_peers > 0 {
            let total: u64 = window
                .iter()
                .map(|index| self.frequency(*index) as u64)
                .sum();
            let avg = total as f64 / window.len() as f64;
            if avg
                < self.strategy.sequential_fallback_threshold
                    * active_peers as f64
            {
                log::debug!(
                    "Sequential window availability {:.2} too low, falling \
                    back to rarest-first for this tick",
                    avg
                );
                return self.select_rarest_first(missing);
            }
        }

        window.into_iter().take(SELECT_FAN_OUT).collect()
    }

    /// Streaming: sequential selection over priority-boosted pieces. The
    /// initial priorities are assigned at construction; a seek re-prioritizes
    /// the pieces around the new position.
    fn select_streaming(&mut self, missing: &[PieceIndex]) -> Vec<PieceIndex> {
        // the first pieces are critical for playback startup; pick them
        // before consulting the window whenever any is still missing
        let startup: Vec<PieceIndex> = missing
            .iter()
            .copied()
            .filter(|index| *index < 5 && self.frequency(*index) > 0)
            .collect();
        if !startup.is_empty() {
            return startup;
        }
        self.select_sequential(missing)
    }

    /// Repositions the sequential cursor after a seek and raises the
    /// priority of the pieces in the new locality.
    pub fn handle_seek(&mut self, target: PieceIndex) {
        if target >= self.pieces.len() {
            return;
        }
        self.sequential_cursor = target;
        let start = target.saturating_sub(2);
        let end =
            (target + self.strategy.sequential_window).min(self.pieces.len());
        for index in start..end {
            if self.pieces[index].state == PieceState::Missing {
                self.pieces[index].priority += 500;
            }
        }
        log::debug!("Seek to piece {}, prioritized [{}, {})", target, start, end);
    }

    fn sequential_position(&self, missing: &[PieceIndex]) -> PieceIndex {
        if self.sequential_cursor > 0 {
            self.sequential_cursor
        } else {
            missing.iter().copied().min().unwrap_or(0)
        }
    }

    fn availability_len(&self) -> usize {
        self.availability.len()
    }

    /// Plans requests for one piece, distributing its unclaimed blocks among
    /// the peers that advertise the piece and have pipeline capacity. In
    /// endgame every missing block is planned towards up to
    /// `endgame_duplicates` distinct peers.
    fn plan_piece(&mut self, index: PieceIndex, plan: &mut RequestPlan) {
        let peers = self.peers_for_piece(index);
        if peers.is_empty() {
            return;
        }

        let endgame = self.endgame;
        let duplicates = self.strategy.endgame_duplicates.max(1);
        let mut planned: Vec<(PeerKey, BlockInfo)> = Vec::new();

        {
            let piece = &mut self.pieces[index];
            let mut peer_cursor = 0usize;

            for block in piece.blocks.iter_mut() {
                if block.received {
                    continue;
                }
                let info = BlockInfo {
                    piece_index: index,
                    offset: block.offset,
                    len: block.len,
                };

                let wanted = if endgame {
                    duplicates.saturating_sub(block.requested_from.len())
                } else if block.requested_from.is_empty() {
                    1
                } else {
                    0
                };

                let mut assigned = 0;
                let mut tried = 0;
                while assigned < wanted && tried < peers.len() {
                    let peer = peers[peer_cursor % peers.len()];
                    peer_cursor += 1;
                    tried += 1;
                    if block.requested_from.contains(&peer) {
                        continue;
                    }
                    let status = match self.peers.get_mut(&peer) {
                        Some(status) => status,
                        None => continue,
                    };
                    if !status.can_request() {
                        continue;
                    }
                    status.outstanding += 1;
                    block.requested_from.insert(peer);
                    planned.push((peer, info));
                    assigned += 1;
                }
            }

            if !planned.is_empty()
                && piece.state == PieceState::Missing
            {
                piece.state = PieceState::Requested;
                piece.request_count += 1;
            }
        }

        for (peer, info) in planned {
            match plan.requests.iter_mut().find(|(key, _)| *key == peer) {
                Some((_, blocks)) => blocks.push(info),
                None => plan.requests.push((peer, vec![info])),
            }
        }
    }

    /// The peers that advertise the piece and may currently be asked for
    /// blocks at all.
    fn peers_for_piece(&self, index: PieceIndex) -> Vec<PeerKey> {
        let mut peers: Vec<PeerKey> = self
            .availability
            .iter()
            .filter(|(peer, pieces)| {
                pieces.contains(&index)
                    && self
                        .peers
                        .get(peer)
                        .map_or(false, |status| status.can_request())
            })
            .map(|(peer, _)| *peer)
            .collect();
        // deterministic distribution regardless of hash map iteration order
        peers.sort_unstable();
        peers
    }
}
