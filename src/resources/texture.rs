//! Texture loading, placeholder handling and layered shadow textures

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::backend::{
    full_mip_chain, GraphicsBackend, TextureDescriptor, TextureFormat, TextureHandle,
    TextureUsage, TextureViewDescriptor, TextureViewDimension, TextureViewHandle,
};
use crate::error::{RenderError, RenderResult};

/// Integer handle to a texture owned by [`TextureManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Decoded RGBA8 pixels
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Decode an encoded image (PNG, JPEG, ...) into RGBA8
    pub fn decode(bytes: &[u8], name: &str) -> RenderResult<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| RenderError::TextureDecode(format!("{}: {}", name, e)))?;
        let rgba = image.to_rgba8();
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            data: rgba.into_raw(),
            name: name.to_string(),
        })
    }

    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }
}

struct LoadedTexture {
    texture: TextureHandle,
    view: TextureViewHandle,
    width: u32,
    height: u32,
}

type DecodeResult = (TextureId, RenderResult<TextureData>);

/// Owns 2D material textures
///
/// Encoded images are decoded on worker threads; until a texture has been
/// uploaded its id resolves to the placeholder. Uploads happen on the GPU
/// thread in [`process_uploads`](Self::process_uploads).
pub struct TextureManager {
    placeholder: LoadedTexture,
    textures: HashMap<TextureId, LoadedTexture>,
    pending: Vec<TextureId>,
    decoded: Arc<Mutex<Vec<DecodeResult>>>,
    next_id: u32,
}

impl TextureManager {
    /// Id that always resolves to the placeholder
    pub const PLACEHOLDER: TextureId = TextureId(0);

    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        let placeholder = upload(
            backend,
            &TextureData::solid_color([255, 255, 255, 255], "placeholder"),
        )?;
        Ok(Self {
            placeholder,
            textures: HashMap::new(),
            pending: Vec::new(),
            decoded: Arc::new(Mutex::new(Vec::new())),
            next_id: 1,
        })
    }

    fn allocate_id(&mut self) -> TextureId {
        let id = TextureId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Upload already decoded pixels right away
    pub fn create<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        data: &TextureData,
    ) -> RenderResult<TextureId> {
        let loaded = upload(backend, data)?;
        let id = self.allocate_id();
        self.textures.insert(id, loaded);
        Ok(id)
    }

    /// Start decoding `bytes` on a worker thread and return the id immediately
    pub fn load_async(&mut self, bytes: Vec<u8>, name: &str) -> TextureId {
        let id = self.allocate_id();
        self.pending.push(id);

        let decoded = Arc::clone(&self.decoded);
        let name = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("texture-decode-{}", id.0))
            .spawn(move || {
                let result = TextureData::decode(&bytes, &name);
                decoded.lock().push((id, result));
            });
        if let Err(e) = spawned {
            log::warn!("Failed to spawn texture decode thread: {}", e);
            self.pending.retain(|p| *p != id);
        }
        id
    }

    /// Upload every texture whose decode has finished. Returns how many were uploaded.
    pub fn process_uploads<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> RenderResult<usize> {
        let finished: Vec<DecodeResult> = std::mem::take(&mut *self.decoded.lock());
        let mut uploaded = 0;
        for (id, result) in finished {
            self.pending.retain(|p| *p != id);
            match result {
                Ok(data) => {
                    let loaded = upload(backend, &data)?;
                    log::debug!(
                        "Uploaded texture '{}' ({}x{}) as {:?}",
                        data.name,
                        data.width,
                        data.height,
                        id
                    );
                    self.textures.insert(id, loaded);
                    uploaded += 1;
                }
                Err(e) => log::warn!("{}; keeping placeholder for {:?}", e, id),
            }
        }
        Ok(uploaded)
    }

    /// Ids whose decode has not been uploaded yet
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_loaded(&self, id: TextureId) -> bool {
        self.textures.contains_key(&id)
    }

    /// View for `id`, or the placeholder view while it is not loaded
    pub fn view(&self, id: TextureId) -> TextureViewHandle {
        self.textures
            .get(&id)
            .map_or(self.placeholder.view, |t| t.view)
    }

    pub fn size(&self, id: TextureId) -> (u32, u32) {
        let t = self.textures.get(&id).unwrap_or(&self.placeholder);
        (t.width, t.height)
    }

    pub fn remove<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, id: TextureId) {
        if let Some(t) = self.textures.remove(&id) {
            backend.destroy_texture(t.texture);
        }
    }
}

fn upload<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    data: &TextureData,
) -> RenderResult<LoadedTexture> {
    let mip_levels = full_mip_chain(data.width, data.height);
    let texture = backend.create_texture(&TextureDescriptor {
        label: Some(data.name.clone()),
        width: data.width,
        height: data.height,
        mip_levels,
        format: TextureFormat::Rgba8UnormSrgb,
        usage: TextureUsage::TEXTURE_BINDING
            | TextureUsage::COPY_DST
            | TextureUsage::RENDER_ATTACHMENT,
        ..Default::default()
    })?;
    backend.write_texture(texture, 0, &data.data, data.width, data.height);
    if mip_levels > 1 {
        backend.generate_mipmaps(texture);
    }
    let view = backend.create_texture_view(texture, &TextureViewDescriptor::default())?;
    Ok(LoadedTexture {
        texture,
        view,
        width: data.width,
        height: data.height,
    })
}

/// How the layers of a [`TextureArray`] are grouped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// One layer per element
    Layers2D,
    /// Six layers per element, sampled as a cube map array
    CubeMaps,
    /// Two layers per element (front and back paraboloid)
    Paraboloids,
}

impl ArrayKind {
    pub fn layers_per_element(&self) -> u32 {
        match self {
            ArrayKind::Layers2D => 1,
            ArrayKind::CubeMaps => 6,
            ArrayKind::Paraboloids => 2,
        }
    }

    fn view_dimension(&self) -> TextureViewDimension {
        match self {
            ArrayKind::CubeMaps => TextureViewDimension::CubeArray,
            ArrayKind::Layers2D | ArrayKind::Paraboloids => TextureViewDimension::D2Array,
        }
    }
}

/// Layered texture used for shadow atlases
///
/// Holds one view over the whole array for sampling and one 2D view per
/// layer for rendering into a single face.
pub struct TextureArray {
    kind: ArrayKind,
    texture: TextureHandle,
    array_view: TextureViewHandle,
    layer_views: Vec<TextureViewHandle>,
    elements: u32,
    size: u32,
    format: TextureFormat,
}

impl TextureArray {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        kind: ArrayKind,
        elements: u32,
        size: u32,
        format: TextureFormat,
    ) -> RenderResult<Self> {
        let elements = elements.max(1);
        let layers = elements * kind.layers_per_element();
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width: size,
            height: size,
            array_layers: layers,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            ..Default::default()
        })?;
        let array_view = backend
            .create_texture_view(texture, &TextureViewDescriptor::with_dimension(kind.view_dimension()))?;
        let layer_views = (0..layers)
            .map(|layer| backend.create_texture_view(texture, &TextureViewDescriptor::layer(layer)))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Allocated {:?} shadow array '{}': {} elements, {} layers of {}x{}",
            kind,
            label,
            elements,
            layers,
            size,
            size
        );
        Ok(Self {
            kind,
            texture,
            array_view,
            layer_views,
            elements,
            size,
            format,
        })
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn array_view(&self) -> TextureViewHandle {
        self.array_view
    }

    pub fn elements(&self) -> u32 {
        self.elements
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// View of one layer of one element, `None` when out of range
    pub fn layer_view(&self, element: u32, layer: u32) -> Option<TextureViewHandle> {
        if layer >= self.kind.layers_per_element() {
            return None;
        }
        self.layer_views
            .get((element * self.kind.layers_per_element() + layer) as usize)
            .copied()
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        backend.destroy_texture(self.texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut bytes, image::ImageOutputFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn wait_for_uploads(manager: &mut TextureManager, backend: &mut RecordingBackend) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.pending_count() > 0 && Instant::now() < deadline {
            manager.process_uploads(backend).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_placeholder_until_uploaded() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut manager = TextureManager::new(&mut backend).unwrap();
        let placeholder = manager.view(TextureManager::PLACEHOLDER);

        let id = manager.load_async(png_bytes(4, 2), "albedo.png");
        assert_eq!(manager.view(id), placeholder);

        wait_for_uploads(&mut manager, &mut backend);
        assert!(manager.is_loaded(id));
        assert_ne!(manager.view(id), placeholder);
        assert_eq!(manager.size(id), (4, 2));
    }

    #[test]
    fn test_decode_failure_keeps_placeholder() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut manager = TextureManager::new(&mut backend).unwrap();
        let id = manager.load_async(vec![1, 2, 3], "broken.png");
        wait_for_uploads(&mut manager, &mut backend);
        assert!(!manager.is_loaded(id));
        assert_eq!(manager.view(id), manager.view(TextureManager::PLACEHOLDER));
    }

    #[test]
    fn test_cube_array_layers() {
        let mut backend = RecordingBackend::new(4, 4);
        let array = TextureArray::new(
            &mut backend,
            "point_shadows",
            ArrayKind::CubeMaps,
            3,
            64,
            TextureFormat::Depth32Float,
        )
        .unwrap();
        let desc = backend.texture_descriptor(array.texture()).unwrap();
        assert_eq!(desc.array_layers, 18);
        assert!(array.layer_view(2, 5).is_some());
        assert!(array.layer_view(3, 0).is_none());
        assert!(array.layer_view(0, 6).is_none());
    }
}
