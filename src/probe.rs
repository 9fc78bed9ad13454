/// Block-Availability Probe Module
///
/// One question, asked over the block exchange: "do you have this CID?"
/// The answer is always a populated [`BlockProbeResult`]; failures land in
/// its error field rather than failing the call, so a single unresponsive
/// peer never takes down the surrounding check.
use cid::Cid;
use libp2p::PeerId;
use tokio::time::Instant;
use tracing::debug;

use crate::bitswap::BitswapMessage;
use crate::host::Host;
use crate::report::BlockProbeResult;

/// Send a WANT_HAVE for `cid` to `peer` and time the round trip.
///
/// `found` means the peer affirmatively claims the block (a HAVE presence
/// or the block data itself); `responded` means any well-formed reply came
/// back, including DONT_HAVE.
pub async fn check_block(host: &Host, cid: &Cid, peer: PeerId) -> BlockProbeResult {
    let start = Instant::now();
    let mut result = BlockProbeResult::default();

    match host.want_have(peer, BitswapMessage::want_have(cid)).await {
        Ok(response) => {
            result.responded = true;
            result.found = response.message.affirms(cid);
            debug!(
                %peer,
                protocol = %response.protocol,
                found = result.found,
                "block probe answered"
            );
        }
        Err(e) => {
            result.error = e.to_string();
            debug!(%peer, "block probe failed: {}", e);
        }
    }

    result.duration_ms = start.elapsed().as_millis() as u64;
    result
}
