use crate::peer::PeerKey;

/// What the scheduler needs to know about one connection, sampled at the start of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    pub key: PeerKey,
    /// we are choking them
    pub choked_them: bool,
    /// they are choking us
    pub choked_us: bool,
    /// they want something from us
    pub interested_us: bool,
    /// we want something from them
    pub interested_them: bool,
    /// bytes we got from them this interval
    pub downloaded: u64,
}

impl PeerView {
    fn uploading(&self) -> bool {
        !self.choked_them
    }

    fn downloading_from(&self) -> bool {
        self.interested_them && !self.choked_us
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub choke: Vec<PeerKey>,
    pub unchoke: Vec<PeerKey>,
}

impl Plan {
    /// Every peer touched this round, these move to the back of the line
    pub fn touched(&self) -> impl Iterator<Item = &PeerKey> {
        self.choke.iter().chain(self.unchoke.iter())
    }
}

/// One round of choking. `peers` is in round-robin order, earlier peers are considered first.
///
/// When every upload slot is taken and more peers are interested than there are slots, one slot
/// is freed by choking, in order of preference, a peer that lost interest, a peer that chokes
/// us, a peer we download from that sent nothing this interval, and otherwise the unchoked peer
/// we got the least from. Free slots then go to choked peers that are interested, reciprocating
/// peers first. The result never leaves more than `max_uploaders` peers unchoked.
pub fn plan(peers: &[PeerView], max_uploaders: usize) -> Plan {
    let mut plan = Plan::default();
    let mut unchoked: Vec<bool> = peers.iter().map(PeerView::uploading).collect();
    let mut uploaders = unchoked.iter().filter(|u| **u).count();
    let interested = peers.iter().filter(|p| p.interested_us).count();

    let target = if interested > max_uploaders {
        max_uploaders.saturating_sub(1)
    } else {
        max_uploaders
    };

    let rules: [fn(&PeerView) -> bool; 3] = [
        |p| !p.interested_us,
        |p| p.choked_us,
        |p| p.downloading_from() && p.downloaded == 0,
    ];

    if uploaders >= max_uploaders && uploaders > target {
        for rule in rules {
            for (i, peer) in peers.iter().enumerate() {
                if uploaders <= target {
                    break;
                }
                if unchoked[i] && rule(peer) {
                    unchoked[i] = false;
                    uploaders -= 1;
                    plan.choke.push(peer.key);
                }
            }
        }

        while uploaders > target {
            let worst = peers
                .iter()
                .enumerate()
                .filter(|(i, _)| unchoked[*i])
                .min_by_key(|(_, p)| p.downloaded)
                .map(|(i, _)| i);
            let Some(i) = worst else {
                break;
            };
            unchoked[i] = false;
            uploaders -= 1;
            plan.choke.push(peers[i].key);
        }
    }

    // optimistic pass, reciprocating peers first
    let candidates = |reciprocal: bool| {
        peers
            .iter()
            .filter(move |p| p.choked_them && p.interested_us && (!p.choked_us) == reciprocal)
    };
    for peer in candidates(true).chain(candidates(false)) {
        if uploaders >= max_uploaders {
            break;
        }
        // a peer freed this round doesn't get its slot straight back
        if plan.choke.contains(&peer.key) {
            continue;
        }
        uploaders += 1;
        plan.unchoke.push(peer.key);
    }

    plan
}
