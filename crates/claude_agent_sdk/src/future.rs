//! Shared boxed-future alias used to type-erase the async callback storage in
//! the hook registry (C5), tool router (C6), and control handler (C4).

/// A boxed, pinned, `Send` future — the shape every stored callback closure returns.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
