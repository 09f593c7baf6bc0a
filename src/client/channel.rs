//! Channel setup for a fresh connection.

use std::sync::Arc;

use tracing::{debug, info};

use super::replies::ReplyRegistry;
use crate::broker::{BrokerChannel, BrokerConnection, BrokerError, InboundReply};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Open a channel and make it ready to carry requests.
///
/// Runs in order: create the channel, assert the work queue (unless
/// skipped), apply the prefetch window, then start the reply consumer.
/// Every frame the consumer receives goes to `replies`.
pub(crate) async fn initialize(
    connection: &dyn BrokerConnection,
    config: &ClientConfig,
    replies: &ReplyRegistry,
) -> Result<Arc<dyn BrokerChannel>> {
    let channel = connection.create_channel().await.map_err(setup_error)?;

    if config.skip_assert() {
        debug!(queue = %config.queue, "Skipping work queue assertion");
    } else {
        channel
            .assert_queue(&config.queue, &config.queue_options)
            .await
            .map_err(setup_error)?;
    }

    channel
        .prefetch(config.prefetch_count, config.is_global_prefetch_count)
        .await
        .map_err(setup_error)?;

    let registry = replies.clone();
    channel
        .consume(
            &config.reply_queue,
            config.no_ack,
            Arc::new(move |reply: InboundReply| {
                registry.dispatch(&reply);
            }),
        )
        .await
        .map_err(setup_error)?;

    info!(
        queue = %config.queue,
        reply_queue = %config.reply_queue,
        prefetch = config.prefetch_count,
        "Reply consumer started"
    );
    Ok(channel)
}

fn setup_error(err: BrokerError) -> ClientError {
    match err {
        BrokerError::Connection(cause) => ClientError::Connection(cause),
        other => ClientError::ChannelSetup(other.to_string()),
    }
}
