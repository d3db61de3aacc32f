use crate::learn::History;
use anyhow::Result;
use plotters::prelude::*;
use std::path::Path;

/// Renders the loss (left) and the accuracy (right) of each epoch to a png at `path`.
///
/// **Errors**
///
/// The image could not be rendered or written.
pub fn plot_metrics(path: impl AsRef<Path>, history: &History, title: &str) -> Result<()> {
    let path = path.as_ref();
    let (width, height) = (1200, 500);
    let root = BitMapBackend::new(path, (width, height)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.titled(title, ("sans-serif", 30))?;
    let (left, right) = root.split_horizontally(width / 2);
    let epochs = history.loss.len().max(history.accuracy.len()).max(1) as f32;
    let loss_max = history
        .loss
        .iter()
        .flatten()
        .copied()
        .fold(0f32, f32::max)
        .max(f32::EPSILON);
    let mut loss_chart = ChartBuilder::on(&left)
        .caption("Loss", ("sans-serif", 20))
        .margin(10)
        .set_all_label_area_size(50)
        .build_cartesian_2d(1f32..epochs.max(2.), 0f32..loss_max * 1.1)?;
    loss_chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc("Loss")
        .x_label_formatter(&|v| format!("{:.0}", v))
        .draw()?;
    let loss = || {
        history
            .loss
            .iter()
            .enumerate()
            .filter_map(|(i, x)| Some((i as f32 + 1., (*x)?)))
    };
    loss_chart.draw_series(LineSeries::new(loss(), &RED))?;
    loss_chart.draw_series(loss().map(|(x, y)| Circle::new((x, y), 3, RED.filled())))?;
    let mut accuracy_chart = ChartBuilder::on(&right)
        .caption("Accuracy", ("sans-serif", 20))
        .margin(10)
        .set_all_label_area_size(50)
        .build_cartesian_2d(1f32..epochs.max(2.), 0f32..100f32)?;
    accuracy_chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc("Accuracy")
        .x_label_formatter(&|v| format!("{:.0}", v))
        .y_label_formatter(&|v| format!("{:.0}%", v))
        .draw()?;
    let accuracy = || {
        history
            .accuracy
            .iter()
            .enumerate()
            .filter_map(|(i, x)| Some((i as f32 + 1., 100. * (*x)?)))
    };
    accuracy_chart.draw_series(LineSeries::new(accuracy(), &BLUE))?;
    accuracy_chart.draw_series(accuracy().map(|(x, y)| Circle::new((x, y), 3, BLUE.filled())))?;
    root.present()?;
    Ok(())
}
