//! Drives the `gridcrop-worker` binary through `ExtractClient::spawn_process`.

use gridcrop::{
    BinarySpawner, ClientError, ConfigRef, ExtractClient, ExtractConfig, ImageCodec,
    ImageCrateCodec, ImageRef, Paddings, Rectangle, Template, Vec2,
};
use image::{Rgba, RgbaImage};

fn spawner() -> BinarySpawner {
    BinarySpawner::new(env!("CARGO_BIN_EXE_gridcrop-worker"))
        .with_env("GRIDCROP_OUTPUT_FORMAT", "png")
        .with_env("GRIDCROP_LOG", "warn")
}

/// Every pixel encodes its own coordinates divided by four.
fn sheet_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x / 4) as u8, (y / 4) as u8, 0, 255])
    });
    ImageCrateCodec::default().encode(&img).unwrap()
}

fn grid(coords: Rectangle) -> ConfigRef {
    ConfigRef::hashed(ExtractConfig::new(Template::uniform(2, 2), coords).with_pads(Paddings::NONE))
}

#[tokio::test]
async fn extracts_boxes_through_the_worker_binary() {
    let client = ExtractClient::spawn_process(&spawner()).unwrap();
    let image = ImageRef::bytes("sheet", sheet_png(80, 60));
    let config = grid(Rectangle::full());

    assert!(client.post_img(&image).await.unwrap());

    let blob = client.extract(&image, 3, &config).await.unwrap().unwrap();
    let region = ImageCrateCodec::default().decode(blob.as_bytes()).unwrap();
    assert_eq!(region.dimensions(), (40, 30));
    assert_eq!(region.get_pixel(0, 0), &Rgba([10, 7, 0, 255]));

    let broken = ImageRef::bytes("broken", b"not an image".to_vec());
    assert!(client.extract(&broken, 0, &config).await.unwrap().is_none());

    client.close().await.unwrap();
}

#[tokio::test]
async fn out_of_range_index_stops_the_worker_process() {
    let client = ExtractClient::spawn_process(&spawner()).unwrap();
    let image = ImageRef::bytes("sheet", sheet_png(80, 60));
    let config = grid(Rectangle::new(Vec2(0.1, 0.1), Vec2(0.8, 0.8)));

    let err = client.extract(&image, 4, &config).await.unwrap_err();
    assert!(matches!(err, ClientError::WorkerFatal(_)), "{err:?}");
    assert!(client.is_closed());

    client.close().await.unwrap();
}
