//! Database access for aoi-agent
//!
//! Pool setup and schema live in `aoi_common::db`; this module holds the
//! result store queries.

pub mod results;

pub use results::{
    commit_result, delete_image, delete_images_older_than, get_image, list_batch_images,
    list_images, regions_for_class, regions_for_image, ClassWithRegions, ImageHierarchy, NewImage,
    ResultGraph,
};
