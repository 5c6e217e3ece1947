//! The layer cache.
//!
//! Layers are memoized by [`Signature`], so setup (primitive descriptors, reorder decisions, scratch buffers) is
//! done once per distinct shape. Entries are never evicted, a factory grows with the number of distinct shapes it
//! sees. Use [`LayerFactory::clear()`] to drop everything.
use crate::{
    engine::{Engine, HostEngine},
    error::LayerError,
    layer::{
        AvgPool, Convolution2D, DeConvolution2D, Layer, Linear, Lrn, MaxPool, Relu, Relu4d,
        Softmax2D, Softmax4D,
    },
    signature::Signature,
};
use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use paste::paste;
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::{self, Debug},
    sync::Arc,
};

/// A shared, lockable layer.
pub type LayerRef<L> = Arc<Mutex<L>>;

/// The cached layers of one type.
pub struct Store<L> {
    map: Mutex<HashMap<Signature, LayerRef<L>>>,
}

impl<L> Default for Store<L> {
    fn default() -> Self {
        Self {
            map: Mutex::default(),
        }
    }
}

impl<L: Layer> Store<L> {
    /// The layer cached for `signature`.
    pub fn get(&self, signature: &Signature) -> Option<LayerRef<L>> {
        let layer = self.map.lock().get(signature).cloned();
        if layer.is_some() {
            log::trace!("hit {signature}");
        }
        layer
    }
    /// Caches `layer` under the signature of its parameters.
    ///
    /// **Errors**
    /// [`LayerError::DuplicateKey`] if a layer is already cached, the cached layer is unchanged.
    pub fn set(&self, layer: L) -> Result<LayerRef<L>, LayerError> {
        match self.map.lock().entry(L::signature(layer.params())) {
            Entry::Occupied(entry) => Err(LayerError::DuplicateKey {
                signature: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                log::debug!("cached {}", entry.key());
                Ok(entry.insert(Arc::new(Mutex::new(layer))).clone())
            }
        }
    }
    /// The layer cached for `signature`, or the layer created by `f`.
    ///
    /// The store is locked while `f` runs, concurrent callers never create a second layer.
    ///
    /// **Errors**
    /// `f` failed, nothing is cached.
    pub fn get_or_try_insert_with(
        &self,
        signature: Signature,
        f: impl FnOnce() -> Result<L>,
    ) -> Result<LayerRef<L>> {
        match self.map.lock().entry(signature) {
            Entry::Occupied(entry) => {
                log::trace!("hit {}", entry.key());
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let layer = f()?;
                log::debug!("cached {}", entry.key());
                Ok(entry.insert(Arc::new(Mutex::new(layer))).clone())
            }
        }
    }
    /// The number of cached layers.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
    /// Whether no layers are cached.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
    /// Drops all cached layers.
    ///
    /// Layers still referenced by callers stay alive until released.
    pub fn clear(&self) {
        self.map.lock().clear();
    }
}

impl<L> Debug for Store<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.map.lock().len())
            .finish()
    }
}

macro_rules! layer_factory {
    ($($field:ident: $layer:ident),* $(,)?) => {
        /// Caches layers by [`Signature`].
        ///
        /// Holds one [`Store`] per layer type and the [`Engine`] that layers build and execute primitives with.
        ///
        /// ```
        /// # fn main() -> anyhow::Result<()> {
        /// use dnn_layers::{factory::LayerFactory, layer::Relu};
        ///
        /// let factory = LayerFactory::default();
        /// let x = [-1f32, 2.];
        /// let mut y = [0f32; 2];
        /// Relu::do_forward(&factory, &[2], &x, &mut y)?;
        /// assert_eq!(y, [0., 2.]);
        /// assert_eq!(factory.len_of::<Relu>(), 1);
        /// # Ok(())
        /// # }
        /// ```
        pub struct LayerFactory {
            engine: Arc<dyn Engine>,
            $(pub(crate) $field: Store<$layer>,)*
        }

        impl LayerFactory {
            /// Creates a factory with `engine`.
            pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
                Self {
                    engine,
                    $($field: Store::default(),)*
                }
            }
            /// The total number of cached layers.
            pub fn len(&self) -> usize {
                0 $(+ self.$field.len())*
            }
            /// Drops all cached layers.
            pub fn clear(&self) {
                $(self.$field.clear();)*
                log::debug!("cleared layer cache");
            }
            paste! {
                $(
                    #[doc = "The cached [`" $layer "`] for `params`."]
                    pub fn [<get_ $field _layer>](
                        &self,
                        params: &<$layer as Layer>::Params,
                    ) -> Option<LayerRef<$layer>> {
                        self.get::<$layer>(params)
                    }
                    #[doc = "Caches `layer` as the [`" $layer "`] for `params`."]
                    #[doc = ""]
                    #[doc = "**Errors**"]
                    #[doc = "[`LayerError::DuplicateKey`] if a layer is already cached, [`LayerError::SignatureMismatch`] if"]
                    #[doc = "`layer` was created for other parameters."]
                    pub fn [<set_ $field _layer>](
                        &self,
                        params: &<$layer as Layer>::Params,
                        layer: $layer,
                    ) -> Result<LayerRef<$layer>> {
                        self.set::<$layer>(params, layer)
                    }
                )*
            }
        }
    };
}

layer_factory! {
    relu: Relu,
    relu4d: Relu4d,
    max_pool: MaxPool,
    avg_pool: AvgPool,
    lrn: Lrn,
    softmax2d: Softmax2D,
    softmax4d: Softmax4D,
    conv2d: Convolution2D,
    deconv2d: DeConvolution2D,
    linear: Linear,
}

static GLOBAL: Lazy<LayerFactory> = Lazy::new(|| {
    LayerFactory::new().unwrap_or_else(|error| {
        log::warn!("{error:?}, using the default engine");
        LayerFactory::default()
    })
});

impl LayerFactory {
    /// Creates a factory with a [`HostEngine`] configured by the environment.
    ///
    /// See [`HostEngine::from_env()`].
    ///
    /// **Errors**
    /// The environment is invalid.
    pub fn new() -> Result<Self> {
        Ok(Self::with_engine(Arc::new(HostEngine::from_env()?)))
    }
    /// The process wide factory.
    ///
    /// Created on first use with [`LayerFactory::new()`], falling back to the default engine.
    pub fn global() -> &'static Self {
        &GLOBAL
    }
    /// The engine.
    pub fn engine(&self) -> &dyn Engine {
        &*self.engine
    }
    /// The layer cached for `params`.
    ///
    /// Never creates a layer.
    pub fn get<L: Layer>(&self, params: &L::Params) -> Option<LayerRef<L>> {
        L::store(self).get(&L::signature(params))
    }
    /// Caches `layer` for `params`.
    ///
    /// **Errors**
    /// - [`LayerError::SignatureMismatch`] if `layer` was created for other parameters.
    /// - [`LayerError::DuplicateKey`] if a layer is already cached, the cached layer is unchanged.
    pub fn set<L: Layer>(&self, params: &L::Params, layer: L) -> Result<LayerRef<L>> {
        let signature = L::signature(params);
        let actual = L::signature(layer.params());
        if actual != signature {
            return Err(LayerError::SignatureMismatch {
                signature,
                layer: actual,
            }
            .into());
        }
        Ok(L::store(self).set(layer)?)
    }
    /// The layer cached for `params`, creating it if necessary.
    ///
    /// At most one layer is created per signature, even with concurrent callers.
    ///
    /// **Errors**
    /// [`LayerError::InvalidShape`], nothing is cached.
    pub fn get_or_create<L: Layer>(&self, params: &L::Params) -> Result<LayerRef<L>> {
        L::store(self).get_or_try_insert_with(L::signature(params), || L::new(params))
    }
    /// Whether no layers are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The number of cached layers of type `L`.
    pub fn len_of<L: Layer>(&self) -> usize {
        L::store(self).len()
    }
}

impl Default for LayerFactory {
    /// A factory with the default [`HostEngine`].
    fn default() -> Self {
        Self::with_engine(Arc::new(HostEngine::default()))
    }
}

impl Debug for LayerFactory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LayerFactory")
            .field("engine", &self.engine)
            .field("len", &self.len())
            .finish()
    }
}
