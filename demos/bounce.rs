//! Moves a square across the stage frame by frame and saves the final
//! canvas as a png, printing the damage rect each partial repaint touched.

use sapling::stage::RenderBlockEvent;
use sapling::{Color, Node, Paint, RasterBackend, Rect, RectShape, Stage, Tier};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let stage = Stage::new(Box::new(RasterBackend), 320.0, 240.0, 1.0)?;
    let root = stage.root();

    let background = Node::leaf(Box::new(RectShape::new(320.0, 240.0)));
    background.set_paint(Paint::fill(Color::rgb(245, 245, 245)));
    root.add_child(background);

    let ball = Node::leaf(Box::new(RectShape::new(24.0, 24.0)));
    ball.set_paint(Paint::fill(Color::rgb(220, 60, 40)));
    ball.set_position(8.0, 108.0);
    root.add_child(ball.clone());

    stage.bind_event_listener::<RenderBlockEvent, _>(|e, _| {
        println!(
            "repainted {:.0}x{:.0} at ({:.0}, {:.0})",
            e.rect.width, e.rect.height, e.rect.x, e.rect.y
        );
    });

    let mut vy = -3.0f32;
    for frame in 0..60 {
        ball.set_x(8.0 + frame as f32 * 4.0);
        ball.set_y((ball.y() + vy).clamp(20.0, 200.0));
        if ball.y() <= 20.0 || ball.y() >= 200.0 {
            vy = -vy;
        }
        stage.update();
    }

    println!("final ball bounds: {:?}", ball.world_bounds(Tier::Box));

    let pixels = stage.read_pixels(&Rect::from_size(320.0, 240.0));
    println!("rendered {} bytes", pixels.len());
    save_png(&stage)?;
    Ok(())
}

fn save_png(stage: &Stage) -> anyhow::Result<()> {
    let data = stage.read_pixels(&Rect::from_size(320.0, 240.0));
    let mut pixmap = tiny_skia::Pixmap::new(320, 240).unwrap();
    pixmap.data_mut().copy_from_slice(&data);
    pixmap.save_png("bounce.png")?;
    println!("wrote bounce.png");
    Ok(())
}
