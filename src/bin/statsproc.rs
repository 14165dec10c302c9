use aws_config::{BehaviorVersion, Region};
use aws_lambda_events::event::kinesis::KinesisEvent;
use aws_sdk_dynamodb::{types::AttributeValue as AV, Client as DdbClient};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use quickroute::stats::{StatsSettings, Tally};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let settings = StatsSettings::from_env().map_err(|e| Error::from(format!("config: {e}")))?;
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = settings.region.clone() {
        loader = loader.region(Region::new(region));
    }
    let conf = loader.load().await;
    let ctx = StatsCtx {
        ddb: DdbClient::new(&conf),
        table: settings.table,
    };

    let func = service_fn(move |event| {
        let ctx = ctx.clone();
        async move { handler(event, &ctx).await }
    });
    lambda_runtime::run(func).await
}

#[derive(Clone)]
struct StatsCtx {
    ddb: DdbClient,
    table: String,
}

async fn handler(event: LambdaEvent<KinesisEvent>, ctx: &StatsCtx) -> Result<(), Error> {
    let mut tally = Tally::new();
    let mut seen = 0usize;
    for rec in event.payload.records {
        // aws_lambda_events has already base64-decoded the payload
        seen += tally.ingest(&rec.kinesis.data.0);
    }
    if tally.is_empty() {
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let mut failed = 0usize;
    let counts = tally.into_counts();
    let keys = counts.len();

    // One UpdateItem per (link, counter); ADD keeps concurrent batches safe
    for ((link_id, key), n) in counts {
        let r = ctx
            .ddb
            .update_item()
            .table_name(&ctx.table)
            .key("link_id", AV::S(link_id.clone()))
            .key("k", AV::S(key.clone()))
            .update_expression("ADD #count :inc SET last_event = :ts")
            .expression_attribute_names("#count", "count")
            .expression_attribute_values(":inc", AV::N(n.to_string()))
            .expression_attribute_values(":ts", AV::N(now.to_string()))
            .send()
            .await;
        if let Err(e) = r {
            failed += 1;
            tracing::error!(link_id, key, "stats update failed: {e:?}");
        }
    }

    // No batch retry on partial failure: the keys that landed would count twice
    tracing::info!(events = seen, keys, failed, "stats batch applied");
    Ok(())
}
