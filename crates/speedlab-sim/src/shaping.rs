use std::time::Duration;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::topology::LinkShaping;

/// Applies link shaping to an interface inside an endpoint using `tc netem`.
///
/// Removes any existing root qdisc first, then installs netem with the
/// link's delay, jitter, loss and rate.
///
/// The netem `rate` parameter adds serialization delay and the queue `limit`
/// is kept finite (derived from the bandwidth-delay product unless set
/// explicitly), so a sender exceeding the link capacity sees drops instead of
/// an ever-growing queue.
pub fn apply_shaping<B: Backend + ?Sized>(
    backend: &mut B,
    endpoint: &str,
    interface: &str,
    shaping: &LinkShaping,
) -> Result<()> {
    // Remove existing qdisc (best effort) to ensure clean state or update
    let _ = backend.exec(endpoint, "tc", &["qdisc", "del", "dev", interface, "root"]);

    let args_storage = netem_args(interface, shaping);
    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = backend.exec(endpoint, "tc", &args)?;
    if !output.success() {
        return Err(Error::CommandExecution {
            endpoint: endpoint.to_string(),
            command: format!("tc {}", args.join(" ")),
            status: output.status,
            stderr: output.stderr,
        });
    }

    tracing::debug!(
        endpoint,
        interface,
        rate_kbit = shaping.rate_kbit,
        delay_ms = shaping.delay.as_millis() as u64,
        "link shaping applied"
    );
    Ok(())
}

/// `tc` arguments installing netem on `interface`:
/// `qdisc add dev <iface> root netem limit N delay D [J] [loss L%] rate Rkbit`.
pub fn netem_args(interface: &str, shaping: &LinkShaping) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];

    args.push("limit".into());
    args.push(queue_limit(shaping).to_string());

    args.push("delay".into());
    args.push(tc_time(shaping.delay));
    if let Some(jitter) = shaping.jitter {
        if !jitter.is_zero() {
            args.push(tc_time(jitter));
        }
    }

    if let Some(loss) = shaping.loss_percent {
        if loss > 0.0 {
            args.push("loss".into());
            args.push(format!("{}%", loss));
        }
    }

    args.push("rate".into());
    args.push(format!("{}kbit", shaping.rate_kbit));
    args
}

/// Explicit limit, or 2 × BDP in MTU-sized packets with a floor of 20.
pub fn queue_limit(shaping: &LinkShaping) -> u32 {
    if let Some(explicit) = shaping.queue_limit {
        return explicit;
    }
    // One-way delay from the link, doubled for full RTT.
    let rtt_ms = shaping.delay.as_millis().saturating_mul(2);
    let bdp_bytes = u128::from(shaping.rate_kbit)
        .saturating_mul(1000 / 8)
        .saturating_mul(rtt_ms)
        / 1000;
    let mtu = 1500u128;
    let bdp_packets = u32::try_from(bdp_bytes / mtu).unwrap_or(u32::MAX);
    std::cmp::max(bdp_packets.saturating_mul(2), 20)
}

fn tc_time(d: Duration) -> String {
    if d.subsec_micros() % 1000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}us", d.as_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netem_args_for_default_link() {
        let shaping = LinkShaping::new(100, Duration::from_millis(100));
        let args = netem_args("left_h-eth0", &shaping);
        assert_eq!(
            args,
            [
                "qdisc",
                "add",
                "dev",
                "left_h-eth0",
                "root",
                "netem",
                "limit",
                "3332",
                "delay",
                "100ms",
                "rate",
                "100000kbit"
            ]
        );
    }

    #[test]
    fn jitter_and_loss_are_appended() {
        let shaping = LinkShaping::new(10, Duration::from_micros(2500))
            .with_jitter(Duration::from_millis(1))
            .with_loss(0.5)
            .with_queue_limit(64);
        let args = netem_args("a-eth0", &shaping).join(" ");
        assert_eq!(
            args,
            "qdisc add dev a-eth0 root netem limit 64 delay 2500us 1ms loss 0.5% rate 10000kbit"
        );
    }

    #[test]
    fn queue_limit_saturates_on_huge_links() {
        let shaping = LinkShaping::new(u64::MAX, Duration::from_millis(u64::MAX));
        assert_eq!(queue_limit(&shaping), u32::MAX);
    }

    #[test]
    fn queue_limit_has_a_floor() {
        let shaping = LinkShaping::new(1, Duration::from_millis(1));
        assert_eq!(queue_limit(&shaping), 20);
    }
}
