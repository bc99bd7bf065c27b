/*!
 * Beacon Event Bus
 *
 * Durable at-least-once event distribution over Redis Streams with
 * competing consumer groups.
 *
 * ## Architecture
 *
 * ```text
 * Producers                 Redis Streams                Consumers
 * ─────────                 ─────────────                ─────────
 *     │                           │                           │
 *     ├─ Publish(envelope) ──────>│ user.events               │
 *     │   validate + XADD         │ contextual.events         │
 *     │                           │ ai.events            ┌────┴────┐
 *     │                           │ market.events        │ group A │──> handler
 *     │                           │ notification.events  │ c1  c2  │
 *     │                           │ system.events        └────┬────┘
 *     │                           │                           │
 *     │                           │ <stream>.dead <───────────┤
 *     │                           │   retry-exhausted /       │
 *     │                           │   handler-fatal /         │
 *     │                           │   validation failures     │
 * ```
 *
 * Each subscription runs one consumer loop: recover its own pending entries,
 * periodically claim stale entries from dead consumers, then block on group
 * reads. A handler reports `Ok`, `Retry(reason)` or `Fatal(reason)`; the bus
 * owns acknowledgement, retry accounting and dead-lettering — handlers never
 * retry themselves.
 *
 * ## Delivery guarantees
 *
 * - Per-stream publish order is preserved at read time.
 * - Within a group, an entry is delivered to one consumer at a time; order
 *   across a group's consumers is not preserved. Subscriptions that need
 *   strict ordering use one consumer with `concurrency: 1`.
 * - Every published envelope is either ACKed after a successful handler run
 *   or ends up on the `<stream>.dead` sibling. Handlers must be idempotent.
 */

pub mod bus;
pub mod consumer;
pub mod dead_letter;
pub mod handler;
pub mod metrics;

pub use bus::{BusConfig, EventBus, SubscribeOptions, SubscriptionHandle, SubscriptionHealth};
pub use handler::{EventHandler, HandlerContext, HandlerOutcome};
