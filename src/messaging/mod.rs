// Messaging gateway and channels.
//
// Submodules:
// - `protocol`: request/reply wire frames and the affinity hash
// - `balancer`: load-balancer contract and built-ins
// - `failover`: failover policy/condition contracts and built-ins
// - `pressure`: outbound and inbound backpressure guards
// - `worker`: affinity-keyed worker pools
// - `channel`: the channel core and public handle
// - `gateway`: the channel registry

pub mod balancer;
pub mod channel;
pub mod failover;
pub mod gateway;
pub mod pressure;
pub mod protocol;
pub mod worker;

pub use balancer::{LoadBalancer, LoadBalancerContext, RandomBalancer, RoundRobinBalancer};
pub use channel::{
    Channel, InboundMessage, MessageReceiver, ReplyStream, Responder, ResponsePart, SendOptions,
};
pub use failover::{
    FailFast, FailoverCondition, FailoverDecision, FailoverPolicy, FailoverRouting, FailureInfo,
    RetrySame, Rotate, TransientOnly,
};
pub use gateway::{ChannelOptions, MessagingGateway};
pub use protocol::affinity_hash;
