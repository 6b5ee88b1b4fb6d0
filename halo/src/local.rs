//! In-process transport backing multi-rank tests.
//!
//! One thread per rank, channel-backed point-to-point messaging with
//! (sender, tag) matching. Messages between a pair of ranks with the
//! same tag are delivered in send order; a receive that has no match
//! yet blocks on the channel and stashes whatever else arrives.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use otm_traits::comm::{RankComm, Tag};
use otm_traits::Rank;

type Packet = (Rank, Tag, Vec<u8>);

const TAG_GATHER: Tag = u32::MAX;
const TAG_BARRIER: Tag = u32::MAX - 1;

pub struct LocalComm {
    rank: Rank,
    peers: Vec<Sender<Packet>>,
    inbox: Receiver<Packet>,
    stash: RefCell<VecDeque<Packet>>,
}

impl LocalComm {
    fn take_matching(&self, from: Rank, tag: Tag) -> Option<Vec<u8>> {
        let mut stash = self.stash.borrow_mut();
        if let Some(pos) = stash
            .iter()
            .position(|(f, t, _)| *f == from && *t == tag)
        {
            return stash.remove(pos).map(|(_, _, payload)| payload);
        }
        None
    }
}

impl RankComm for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: Rank, tag: Tag, payload: Vec<u8>) {
        // a send to a vanished rank is fatal at teardown only; ignore
        let _ = self.peers[to].send((self.rank, tag, payload));
    }

    fn recv(&self, from: Rank, tag: Tag) -> Vec<u8> {
        if let Some(payload) = self.take_matching(from, tag) {
            return payload;
        }
        loop {
            let packet = self
                .inbox
                .recv()
                .expect("rank hung up mid-exchange (lost message is fatal)");
            if packet.0 == from && packet.1 == tag {
                return packet.2;
            }
            self.stash.borrow_mut().push_back(packet);
        }
    }

    fn all_gather(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
        for to in 0..self.size() {
            if to != self.rank {
                self.send(to, TAG_GATHER, payload.clone());
            }
        }
        (0..self.size())
            .map(|from| {
                if from == self.rank {
                    payload.clone()
                } else {
                    self.recv(from, TAG_GATHER)
                }
            })
            .collect()
    }

    fn barrier(&self) {
        for to in 0..self.size() {
            if to != self.rank {
                self.send(to, TAG_BARRIER, Vec::new());
            }
        }
        for from in 0..self.size() {
            if from != self.rank {
                self.recv(from, TAG_BARRIER);
            }
        }
    }
}

/// Spawns `size` rank closures on threads wired into a full mesh.
pub struct LocalCluster;

impl LocalCluster {
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Send + Sync,
        R: Send,
    {
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel::<Packet>();
            senders.push(tx);
            receivers.push(rx);
        }
        let f = &f;
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(size);
            for (rank, inbox) in receivers.into_iter().enumerate() {
                let peers = senders.clone();
                handles.push(scope.spawn(move || {
                    f(LocalComm {
                        rank,
                        peers,
                        inbox,
                        stash: RefCell::new(VecDeque::new()),
                    })
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }
}
