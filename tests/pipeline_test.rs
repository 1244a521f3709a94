//! Command pipeline test: codec decoding through command validation to
//! view mutation, without an X server.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};

use termlay::command::codec::CodecKind;
use termlay::command::{Command, RedrawScheduler};
use termlay::loading::{ImageLoader, LoaderKind};
use termlay::view::View;

fn write_png(name: &str, width: u32, height: u32) -> PathBuf {
    let dir = std::env::temp_dir().join("termlay-pipeline-test");
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join(name);
    let image = RgbImage::from_pixel(width, height, Rgb([40, 80, 120]));
    image.save(&path).expect("writing test image");
    path
}

fn apply_line(
    codec: CodecKind,
    line: &str,
    view: &mut View,
    loader: &ImageLoader,
    scheduler: &mut RedrawScheduler,
) {
    let record = codec.decode(line).expect("line decodes");
    let command = Command::from_record(&record).expect("record validates");
    if command.apply(view, loader) {
        scheduler.schedule();
    }
}

#[test]
fn add_places_a_decoded_image() {
    let path = write_png("add.png", 6, 3);
    let loader = ImageLoader::new(LoaderKind::Synchronous);
    let mut view = View::default();
    let mut scheduler = RedrawScheduler::default();

    let line = format!(
        r#"{{"action":"add","identifier":"pic","x":4,"y":2,"path":"{}"}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &line, &mut view, &loader, &mut scheduler);

    assert!(scheduler.take());
    let placement = view.media.get_mut("pic").expect("placement exists");
    assert_eq!((placement.x, placement.y), (4, 2));
    let image = placement.image();
    assert_eq!((image.width(), image.height()), (6, 3));
}

#[test]
fn every_codec_drives_the_same_pipeline() {
    let path = write_png("codecs.png", 2, 2);
    let loader = ImageLoader::new(LoaderKind::Synchronous);
    let path_text = path.display().to_string();

    let lines = [
        (
            CodecKind::Json,
            format!(r#"{{"action":"add","identifier":"j","x":1,"y":1,"path":"{path_text}"}}"#),
        ),
        (
            CodecKind::Simple,
            format!("action\tadd\tidentifier\ts\tx\t1\ty\t1\tpath\t{path_text}"),
        ),
        (
            CodecKind::Bash,
            format!(
                r#"declare -A cmd=([action]="add" [identifier]="b" [x]="1" [y]="1" [path]="{path_text}")"#
            ),
        ),
    ];

    let mut view = View::default();
    let mut scheduler = RedrawScheduler::default();
    for (codec, line) in &lines {
        apply_line(*codec, line, &mut view, &loader, &mut scheduler);
    }

    assert_eq!(view.media.len(), 3);
    for identifier in ["j", "s", "b"] {
        let placement = view.media.get_mut(identifier).expect("placement");
        assert_eq!(placement.image().width(), 2);
    }
}

#[test]
fn unchanged_file_keeps_the_decoded_image() {
    let path = write_png("reuse.png", 5, 5);
    let loader = ImageLoader::new(LoaderKind::Synchronous);
    let mut view = View::default();
    let mut scheduler = RedrawScheduler::default();

    let line = format!(
        r#"{{"action":"add","identifier":"r","x":0,"y":0,"path":"{}"}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &line, &mut view, &loader, &mut scheduler);
    let first = view
        .media
        .get_mut("r")
        .expect("placement")
        .image();

    // Same path, unchanged mtime: the second add must not decode again.
    let line = format!(
        r#"{{"action":"add","identifier":"r","x":9,"y":9,"path":"{}"}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &line, &mut view, &loader, &mut scheduler);

    let placement = view.media.get("r").expect("placement");
    assert_eq!((placement.x, placement.y), (9, 9));
    let second = placement.image_if_ready().expect("image kept");
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn reusing_an_unchanged_file_leaves_the_loader_idle() {
    let path = write_png("reuse-idle.png", 4, 4);
    let loader = ImageLoader::new(LoaderKind::Synchronous);
    let load_errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&load_errors);
    loader.register_error_handler(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut view = View::default();
    let mut scheduler = RedrawScheduler::default();
    let line = format!(
        r#"{{"action":"add","identifier":"idle","x":0,"y":0,"path":"{}"}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &line, &mut view, &loader, &mut scheduler);
    let first = view.media.get_mut("idle").expect("placement").image();

    // Deleting the file makes any reload attempt observable as a load
    // error; a reusable add must not ask the loader at all.
    std::fs::remove_file(&path).expect("removing test image");
    let line = format!(
        r#"{{"action":"add","identifier":"idle","x":5,"y":5,"path":"{}"}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &line, &mut view, &loader, &mut scheduler);

    assert_eq!(load_errors.load(Ordering::SeqCst), 0);
    let placement = view.media.get("idle").expect("placement");
    assert_eq!((placement.x, placement.y), (5, 5));
    let kept = placement.image_if_ready().expect("image kept");
    assert!(Arc::ptr_eq(&first, &kept));
}

#[test]
fn add_and_remove_round_trip() {
    let path = write_png("roundtrip.png", 3, 3);
    let loader = ImageLoader::new(LoaderKind::Synchronous);
    let mut view = View::default();
    let mut scheduler = RedrawScheduler::default();
    let mut redraws = 0;

    let add = format!(
        r#"{{"action":"add","identifier":"once","x":0,"y":0,"path":"{}"}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &add, &mut view, &loader, &mut scheduler);
    if scheduler.take() {
        redraws += 1;
    }

    apply_line(
        CodecKind::Json,
        r#"{"action":"remove","identifier":"once"}"#,
        &mut view,
        &loader,
        &mut scheduler,
    );
    if scheduler.take() {
        redraws += 1;
    }

    assert!(view.media.is_empty());
    assert_eq!(redraws, 2);

    // Removing again is a silent no-op without a redraw.
    apply_line(
        CodecKind::Json,
        r#"{"action":"remove","identifier":"once"}"#,
        &mut view,
        &loader,
        &mut scheduler,
    );
    assert!(!scheduler.take());
}

#[test]
fn draw_false_defers_the_redraw() {
    let path = write_png("deferred.png", 2, 1);
    let loader = ImageLoader::new(LoaderKind::Synchronous);
    let mut view = View::default();
    let mut scheduler = RedrawScheduler::default();

    let line = format!(
        r#"{{"action":"add","identifier":"quiet","x":0,"y":0,"path":"{}","draw":false}}"#,
        path.display()
    );
    apply_line(CodecKind::Json, &line, &mut view, &loader, &mut scheduler);

    assert_eq!(view.media.len(), 1);
    assert!(!scheduler.take());
}
