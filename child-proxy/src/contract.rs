//! Statically declared method surface shared by controller and worker.
//!
//! A contract is declared once with [`remote_contract!`](crate::remote_contract)
//! and compiled into both sides: the controller gets a typed client on
//! [`Proxy`](crate::Proxy), the worker gets a service trait to implement and
//! a [`Dispatch`] impl that routes `work` messages to it.

use std::marker::PhantomData;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::protocol::RemoteError;
use crate::error::ProxyError;
use crate::worker::Target;

/// Name and argument count of one remote method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub arity: usize,
}

impl MethodSpec {
    pub const fn new(name: &'static str, arity: usize) -> Self {
        Self { name, arity }
    }
}

/// Marker type describing a remote object's methods.
pub trait Contract: Send + Sync + 'static {
    const NAME: &'static str;
    const METHODS: &'static [MethodSpec];

    fn method(name: &str) -> Option<&'static MethodSpec> {
        Self::METHODS.iter().find(|m| m.name == name)
    }
}

/// Positional call arguments, serialized as they are added.
///
/// The first serialization failure is kept and reported when the call is
/// submitted, so the builder chain stays infallible.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<Value>,
    error: Option<String>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<A: Serialize + ?Sized>(mut self, arg: &A) -> Self {
        match serde_json::to_value(arg) {
            Ok(value) => self.values.push(value),
            Err(e) => {
                self.values.push(Value::Null);
                self.error.get_or_insert_with(|| e.to_string());
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Result<Vec<Value>, ProxyError> {
        match self.error {
            Some(e) => Err(ProxyError::Encode(e)),
            None => Ok(self.values),
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self {
            values,
            error: None,
        }
    }
}

/// Worker-side decoder for the arguments of one `work` message.
pub struct ArgReader<'a> {
    method: &'a str,
    args: std::vec::IntoIter<Value>,
    position: usize,
}

impl<'a> ArgReader<'a> {
    /// Fails unless exactly `expected` arguments were sent.
    pub fn new(method: &'a str, args: Vec<Value>, expected: usize) -> Result<Self, RemoteError> {
        if args.len() != expected {
            return Err(RemoteError::invalid_arguments(format!(
                "`{method}` takes {expected} argument(s), got {}",
                args.len()
            )));
        }
        Ok(Self {
            method,
            args: args.into_iter(),
            position: 0,
        })
    }

    pub fn take<T: DeserializeOwned>(&mut self) -> Result<T, RemoteError> {
        let position = self.position;
        self.position += 1;
        let value = self.args.next().ok_or_else(|| {
            RemoteError::invalid_arguments(format!(
                "`{}` is missing argument {position}",
                self.method
            ))
        })?;
        serde_json::from_value(value).map_err(|e| {
            RemoteError::invalid_arguments(format!(
                "argument {position} of `{}`: {e}",
                self.method
            ))
        })
    }
}

/// Routes method calls for contract `Self` to a service `S`.
pub trait Dispatch<S>: Contract {
    fn dispatch<'a>(
        service: &'a S,
        method: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value, RemoteError>>;

    fn dispose(_service: &S) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(async { Ok(()) })
    }
}

/// A service bound to the contract it serves; the worker's [`Target`].
pub struct Served<C, S> {
    service: S,
    _contract: PhantomData<fn() -> C>,
}

impl<C, S> Served<C, S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            _contract: PhantomData,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }
}

impl<C, S> Target for Served<C, S>
where
    C: Dispatch<S>,
    S: Send + Sync + 'static,
{
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value, RemoteError>> {
        C::dispatch(&self.service, method, args)
    }

    fn dispose(&self) -> BoxFuture<'_, Result<(), RemoteError>> {
        C::dispose(&self.service)
    }
}

pub fn encode_result<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value)
        .map_err(|e| RemoteError::new("encode", format!("failed to encode result: {e}")))
}

#[doc(hidden)]
pub mod __private {
    pub use futures::future::BoxFuture;
    pub use serde_json::Value;
}

#[doc(hidden)]
#[macro_export]
macro_rules! __unit {
    ($x:tt) => {
        ()
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __count {
    ($($x:tt)*) => {
        <[()]>::len(&[$($crate::__unit!($x)),*])
    };
}

/// Declare a remote contract.
///
/// ```ignore
/// remote_contract! {
///     pub contract Calculator {
///         client: CalculatorClient;
///         service: CalculatorService;
///
///         fn add(a: i64, b: i64) -> i64;
///         fn reset() -> ();
///     }
/// }
/// ```
///
/// Generates the `Calculator` marker type, a `CalculatorClient` trait
/// implemented for `Proxy<Calculator>`, a `CalculatorService` trait for the
/// worker to implement (`on_dispose` is optional), and the routing between
/// them. `Calculator::target(service)` wraps a service for a `TargetRegistry`.
#[macro_export]
macro_rules! remote_contract {
    (
        $vis:vis contract $name:ident {
            client: $client:ident;
            service: $service:ident;
            $( fn $method:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty ; )*
        }
    ) => {
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $name {
            $vis fn target<S: $service>(service: S) -> $crate::Served<$name, S> {
                $crate::Served::new(service)
            }
        }

        impl $crate::Contract for $name {
            const NAME: &'static str = stringify!($name);
            const METHODS: &'static [$crate::MethodSpec] = &[
                $( $crate::MethodSpec::new(stringify!($method), $crate::__count!($($arg)*)) ),*
            ];
        }

        $vis trait $client {
            $( fn $method(&self $(, $arg: $ty)*) -> $crate::Call<$ret>; )*
        }

        impl $client for $crate::Proxy<$name> {
            $(
                fn $method(&self $(, $arg: $ty)*) -> $crate::Call<$ret> {
                    self.invoke(stringify!($method), $crate::Args::new() $(.arg(&$arg))*)
                }
            )*
        }

        $vis trait $service: Send + Sync + 'static {
            $(
                fn $method(&self $(, $arg: $ty)*)
                    -> impl ::std::future::Future<Output = ::std::result::Result<$ret, $crate::RemoteError>> + Send;
            )*

            fn on_dispose(&self)
                -> impl ::std::future::Future<Output = ::std::result::Result<(), $crate::RemoteError>> + Send
            {
                async { Ok(()) }
            }
        }

        impl<S: $service> $crate::Dispatch<S> for $name {
            fn dispatch<'a>(
                service: &'a S,
                method: &'a str,
                args: ::std::vec::Vec<$crate::__private::Value>,
            ) -> $crate::__private::BoxFuture<'a, ::std::result::Result<$crate::__private::Value, $crate::RemoteError>> {
                ::std::boxed::Box::pin(async move {
                    $(
                        if method == stringify!($method) {
                            #[allow(unused_mut, unused_variables)]
                            let mut reader = $crate::ArgReader::new(method, args, $crate::__count!($($arg)*))?;
                            $( let $arg: $ty = reader.take()?; )*
                            let value = <S as $service>::$method(service $(, $arg)*).await?;
                            return $crate::encode_result(&value);
                        }
                    )*
                    Err($crate::RemoteError::unknown_method(method))
                })
            }

            fn dispose(
                service: &S,
            ) -> $crate::__private::BoxFuture<'_, ::std::result::Result<(), $crate::RemoteError>> {
                ::std::boxed::Box::pin(<S as $service>::on_dispose(service))
            }
        }
    };
}
