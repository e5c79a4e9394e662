//! Host-side image containers and the dataset traits the pipelines consume.
//!
//! Datasets are implemented outside this crate. Loader workers call them from
//! background threads, so every trait here is `Send + Sync` and read-only.

/// One decoded image in CHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Vec<f32>,
    shape: [usize; 3],
}

impl Image {
    pub fn new(pixels: Vec<f32>, shape: [usize; 3]) -> anyhow::Result<Self> {
        let expected: usize = shape.iter().product();
        if pixels.len() != expected {
            anyhow::bail!(
                "image buffer has {} values, shape {:?} needs {expected}",
                pixels.len(),
                shape
            );
        }
        Ok(Self { pixels, shape })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }
}

/// A stack of equally-shaped images, NCHW.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pixels: Vec<f32>,
    shape: [usize; 4],
}

impl ImageBatch {
    /// A batch with zero images of the given CHW shape.
    pub fn empty(image_shape: [usize; 3]) -> Self {
        let [c, h, w] = image_shape;
        Self {
            pixels: Vec::new(),
            shape: [0, c, h, w],
        }
    }

    /// Stack images into one batch. All images must share a shape.
    pub fn stack(images: Vec<Image>) -> anyhow::Result<Self> {
        let Some(first) = images.first() else {
            anyhow::bail!("cannot stack an empty image list");
        };
        let [c, h, w] = first.shape;
        let mut pixels = Vec::with_capacity(images.len() * c * h * w);
        for (i, image) in images.iter().enumerate() {
            if image.shape != first.shape {
                anyhow::bail!(
                    "image {i} has shape {:?}, expected {:?}",
                    image.shape,
                    first.shape
                );
            }
            pixels.extend_from_slice(&image.pixels);
        }
        Ok(Self {
            pixels,
            shape: [images.len(), c, h, w],
        })
    }

    /// Concatenate batches along the batch dimension.
    pub fn concat(parts: &[&ImageBatch]) -> anyhow::Result<Self> {
        let Some(first) = parts.first() else {
            anyhow::bail!("cannot concatenate zero batches");
        };
        let image_shape = first.image_shape();
        let mut pixels = Vec::with_capacity(parts.iter().map(|p| p.pixels.len()).sum());
        let mut n = 0;
        for part in parts {
            if part.image_shape() != image_shape {
                anyhow::bail!(
                    "batch image shape {:?} does not match {:?}",
                    part.image_shape(),
                    image_shape
                );
            }
            pixels.extend_from_slice(&part.pixels);
            n += part.len();
        }
        let [c, h, w] = image_shape;
        Ok(Self {
            pixels,
            shape: [n, c, h, w],
        })
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn image_shape(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }
}

/// A batch of images tagged with the dataset rows they were read from.
#[derive(Debug, Clone)]
pub struct IndexedBatch {
    pub images: ImageBatch,
    pub indices: Vec<usize>,
}

/// Gallery/query split of a place-recognition dataset.
///
/// Samples `[0, num_gallery)` are gallery images; the next `num_queries`
/// samples are queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStruct {
    pub num_gallery: usize,
    pub num_queries: usize,
}

impl DbStruct {
    pub fn total(&self) -> usize {
        self.num_gallery + self.num_queries
    }
}

/// Random-access image source.
pub trait ImageDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn image(&self, index: usize) -> anyhow::Result<Image>;
}

/// Gallery + query dataset with ground truth.
pub trait PlaceDataset: ImageDataset {
    fn db_struct(&self) -> DbStruct;

    /// Ground-truth gallery indices for every query, in query order.
    fn positives(&self) -> anyhow::Result<Vec<Vec<usize>>>;
}

/// One mined training example: a query, its positive, and its negatives.
#[derive(Debug, Clone)]
pub struct TripletSample {
    pub query: Image,
    pub positive: Image,
    pub negatives: Vec<Image>,
    /// Query index within the training query set.
    pub index: usize,
}

/// Query-side training set that mines positives and negatives.
///
/// Returning `Ok(None)` marks a query that produced no usable triplet (for
/// example, no positive within range); the collate step drops it.
pub trait TripletDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample(&self, index: usize) -> anyhow::Result<Option<TripletSample>>;
}

/// Labelled images for the domain-adversarial task.
pub trait DomainDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image and its domain label.
    fn sample(&self, index: usize) -> anyhow::Result<(Image, usize)>;
}
