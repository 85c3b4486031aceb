use anyhow::{bail, Context};
use serde_json::{json, Value};

use vtb_core::{
    config::Config,
    metrics::UsageKind,
    policy::{ReportSelector, UsagePolicy},
    quota::Remaining,
};

const USAGE: &str = "usage: vtb <command>
  quota <user-id>                   remaining requests and wait
  admit <user-id>                   check and record one request
  vip add|remove <user-id>          grant or revoke unlimited access
  vip list                          list unlimited users
  track <user-id> transcription     record a transcription
  track <user-id> style <tag>       record a style call (proofread|my|business|brief)
  stats [all|YYYY-MM]               usage statistics (default: current month)";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vtb_core::logging::init("vtb")?;

    let cfg = Config::load().context("loading configuration")?;
    let policy = UsagePolicy::open(&cfg).await;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let out = run(&policy, &args).await?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(policy: &UsagePolicy, args: &[String]) -> anyhow::Result<Value> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let out = match args.as_slice() {
        ["quota", id] => {
            let status = policy.remaining_and_wait(id).await;
            let remaining = match status.remaining {
                Remaining::Unlimited => Value::Null,
                Remaining::Limited(n) => json!(n),
            };
            json!({
                "user": id,
                "allowed": policy.is_allowed(id).await,
                "unlimited": status.remaining == Remaining::Unlimited,
                "remaining": remaining,
                "wait_secs": status.wait.as_secs(),
            })
        }
        ["admit", id] => {
            let admitted = policy.try_admit(id).await;
            if !admitted {
                tracing::info!(user = %id, "request refused by quota");
            }
            json!({ "user": id, "admitted": admitted })
        }
        ["vip", "add", id] => json!({ "user": id, "changed": policy.grant(id).await }),
        ["vip", "remove", id] => json!({ "user": id, "changed": policy.revoke(id).await }),
        ["vip", "list"] => json!(policy.list_granted().await),
        ["track", id, "transcription"] => {
            policy.track(id, UsageKind::Transcription).await;
            json!({ "user": id, "tracked": "transcription" })
        }
        ["track", id, "style", tag] => {
            policy.track(id, UsageKind::Style(tag.to_string())).await;
            json!({ "user": id, "tracked": "style", "tag": tag })
        }
        ["stats"] => {
            let selector = ReportSelector::Month(policy.current_month()?);
            serde_json::to_value(policy.report(selector).await)?
        }
        ["stats", which] => {
            let selector: ReportSelector = which
                .parse()
                .with_context(|| format!("bad stats selector {which:?}"))?;
            serde_json::to_value(policy.report(selector).await)?
        }
        _ => bail!("{USAGE}"),
    };
    Ok(out)
}
