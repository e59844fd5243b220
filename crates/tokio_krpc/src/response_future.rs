use crate::transaction::{ActiveTransactions, TransactionId};
use futures::Future;
use krpc_encoding::Envelope;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Resolves when the response for `transaction_id` appears in the
/// transaction manager; dropped without a response, it releases the
/// transaction slot rather than leaking it until GC.
pub struct ResponseFuture {
    transaction_id: TransactionId,
    transactions: ActiveTransactions,
    done: bool,
}

impl ResponseFuture {
    pub fn new(transaction_id: TransactionId, transactions: ActiveTransactions) -> ResponseFuture {
        ResponseFuture {
            transaction_id,
            transactions,
            done: false,
        }
    }
}

impl Future for ResponseFuture {
    type Output = crate::errors::Result<Envelope>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.transactions.poll_response(this.transaction_id, cx.waker()) {
            Ok(Some(envelope)) => {
                this.done = true;
                Poll::Ready(Ok(envelope))
            }
            Ok(None) => Poll::Pending,
            Err(e) => {
                this.done = true;
                Poll::Ready(Err(e))
            }
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            self.transactions.drop_transaction(self.transaction_id);
        }
    }
}
