use std::future::Future;

use crate::ack::AckType;
use crate::transport::DeliveryInfo;

/// Domain callback for one subscription.
///
/// Called once per successfully decoded delivery, strictly one at a time per
/// subscription. The returned verdict settles that delivery.
///
/// Implemented for any `FnMut(T) -> impl Future<Output = AckType>`; wrap a
/// `FnMut(T, DeliveryInfo)` closure with [`with_delivery_info`] when the
/// handler needs the routing key or redelivery flag.
pub trait Handler<T>: Send + 'static {
    fn handle(&mut self, message: T, info: &DeliveryInfo) -> impl Future<Output = AckType> + Send;
}

impl<T, F, Fut> Handler<T> for F
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send,
{
    fn handle(&mut self, message: T, _info: &DeliveryInfo) -> impl Future<Output = AckType> + Send {
        (self)(message)
    }
}

pub struct WithDeliveryInfo<F>(F);

pub fn with_delivery_info<F>(handler: F) -> WithDeliveryInfo<F> {
    WithDeliveryInfo(handler)
}

impl<T, F, Fut> Handler<T> for WithDeliveryInfo<F>
where
    F: FnMut(T, DeliveryInfo) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send,
{
    fn handle(&mut self, message: T, info: &DeliveryInfo) -> impl Future<Output = AckType> + Send {
        (self.0)(message, info.clone())
    }
}
